use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::domain::{ActionRecord, Bead};

/// Actions kept per bead; older entries are dropped.
const HISTORY_LIMIT: usize = 50;
/// Only this many trailing actions are scanned for repeats.
const RECENT_WINDOW: usize = 15;
/// Progress younger than this suppresses stuck detection.
const PROGRESS_WINDOW_SECS: i64 = 300;

const DEFAULT_REPEAT_THRESHOLD: usize = 3;
const MIN_REPEAT_THRESHOLD: usize = 2;

/// Distinguishes productive investigation from a stuck loop by hashing each
/// action into a progress key and watching for consecutive repeats while the
/// progress metrics stand still.
#[derive(Debug, Clone, Copy)]
pub struct LoopDetector {
    repeat_threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self {
            repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
        }
    }
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher threshold means more patience before flagging a loop. Clamped
    /// to a minimum of 2; a single repeat is normal work.
    pub fn with_repeat_threshold(threshold: usize) -> Self {
        Self {
            repeat_threshold: threshold.max(MIN_REPEAT_THRESHOLD),
        }
    }

    pub fn repeat_threshold(&self) -> usize {
        self.repeat_threshold
    }

    /// Stable key identifying a semantically equivalent action: equal for
    /// identical (type, primary target) pairs regardless of other fields.
    pub fn progress_key(action: &ActionRecord) -> String {
        let canonical = format!("{}:{}", action.action_type, action.primary_target());
        let digest = Sha256::digest(canonical.as_bytes());
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Appends the action to the bead's history (capped) and updates the
    /// progress metrics.
    pub fn record_action(&self, bead: &mut Bead, mut action: ActionRecord) {
        action.progress_key = Self::progress_key(&action);
        let action_time = action.timestamp;
        let action_type = action.action_type.clone();

        let history = &mut bead.context.action_history;
        history.push(action);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(..excess);
        }

        let metrics = &mut bead.context.progress_metrics;
        let progress_made = match action_type.as_str() {
            "read_file" | "glob" | "grep" => {
                metrics.files_read += 1;
                true
            }
            "edit_file" | "write_file" => {
                metrics.files_modified += 1;
                true
            }
            "run_tests" | "test" => {
                metrics.tests_run += 1;
                true
            }
            "bash" | "execute" => {
                metrics.commands_executed += 1;
                true
            }
            _ => false,
        };
        if progress_made {
            metrics.last_progress = Some(action_time);
        }
    }

    /// Whether the bead is stuck in a non-productive loop, with a reason.
    pub fn is_stuck_in_loop(&self, bead: &Bead) -> (bool, String) {
        self.is_stuck_at(bead, Utc::now())
    }

    fn is_stuck_at(&self, bead: &Bead, now: DateTime<Utc>) -> (bool, String) {
        let history = &bead.context.action_history;
        if history.len() < self.repeat_threshold * 2 {
            return (false, String::new());
        }

        if self.has_recent_progress(bead, now) {
            return (false, String::new());
        }

        let (key, count) = self.longest_recent_run(history);
        if count >= self.repeat_threshold {
            return (
                true,
                format!(
                    "Repeated action pattern {} times without progress: {}",
                    count, key
                ),
            );
        }

        (false, String::new())
    }

    fn has_recent_progress(&self, bead: &Bead, now: DateTime<Utc>) -> bool {
        match bead.context.progress_metrics.last_progress {
            Some(at) => now.signed_duration_since(at) < Duration::seconds(PROGRESS_WINDOW_SECS),
            None => false,
        }
    }

    /// Longest run of consecutive identical progress keys within the recent
    /// window. Ties go to the most recent run.
    fn longest_recent_run(&self, history: &[ActionRecord]) -> (String, usize) {
        let recent = if history.len() > RECENT_WINDOW {
            &history[history.len() - RECENT_WINDOW..]
        } else {
            history
        };

        let mut best_key = String::new();
        let mut best_count = 0usize;
        let mut run_key: Option<&str> = None;
        let mut run_count = 0usize;

        for action in recent {
            if run_key == Some(action.progress_key.as_str()) {
                run_count += 1;
            } else {
                run_key = Some(action.progress_key.as_str());
                run_count = 1;
            }
            if run_count >= best_count {
                best_count = run_count;
                best_key = action.progress_key.clone();
            }
        }

        (best_key, best_count)
    }

    pub fn progress_summary(&self, bead: &Bead) -> String {
        if bead.context.action_history.is_empty()
            && bead.context.progress_metrics.last_progress.is_none()
        {
            return "No progress data".to_string();
        }
        bead.context.progress_metrics.summary()
    }

    pub fn reset_progress(&self, bead: &mut Bead) {
        bead.context.reset_progress();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BeadPriority;

    fn bead() -> Bead {
        Bead::new("Investigate crash", "", BeadPriority::P2, "bug")
    }

    fn read_action(path: &str) -> ActionRecord {
        ActionRecord::new("agent-1", "read_file").with_data("file_path", path)
    }

    fn backdate_progress(bead: &mut Bead, minutes: i64) {
        bead.context.progress_metrics.last_progress = Some(Utc::now() - Duration::minutes(minutes));
    }

    #[test]
    fn test_progress_key_stability() {
        let a = read_action("test.go");
        let b = read_action("test.go");
        assert_eq!(LoopDetector::progress_key(&a), LoopDetector::progress_key(&b));

        let c = read_action("other.go");
        assert_ne!(LoopDetector::progress_key(&a), LoopDetector::progress_key(&c));

        let d = ActionRecord::new("agent-2", "edit_file").with_data("file_path", "test.go");
        assert_ne!(LoopDetector::progress_key(&a), LoopDetector::progress_key(&d));

        // Agent identity and extra fields do not affect the key
        let e = ActionRecord::new("agent-9", "read_file")
            .with_data("file_path", "test.go")
            .with_data("offset", 100);
        assert_eq!(LoopDetector::progress_key(&a), LoopDetector::progress_key(&e));
    }

    #[test]
    fn test_record_updates_history_and_metrics() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        detector.record_action(&mut bead, read_action("a.rs"));
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "edit_file").with_data("file_path", "a.rs"),
        );
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "run_tests").with_data("command", "cargo test"),
        );
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "bash").with_data("command", "git status"),
        );

        let metrics = &bead.context.progress_metrics;
        assert_eq!(metrics.files_read, 1);
        assert_eq!(metrics.files_modified, 1);
        assert_eq!(metrics.tests_run, 1);
        assert_eq!(metrics.commands_executed, 1);
        assert!(metrics.last_progress.is_some());
        assert_eq!(bead.context.action_history.len(), 4);
        assert!(!bead.context.action_history[0].progress_key.is_empty());
    }

    #[test]
    fn test_history_capped_at_fifty() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        for i in 0..60 {
            detector.record_action(&mut bead, read_action(&format!("file{}.rs", i)));
        }

        assert_eq!(bead.context.action_history.len(), 50);
        // Oldest entries were dropped, newest retained
        let last = bead.context.action_history.last().unwrap();
        assert_eq!(last.primary_target(), "file59.rs");
    }

    #[test]
    fn test_verbose_repeat_without_progress_is_stuck() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        for _ in 0..7 {
            detector.record_action(&mut bead, read_action("test.go"));
        }
        backdate_progress(&mut bead, 10);

        let (stuck, reason) = detector.is_stuck_in_loop(&bead);
        assert!(stuck);
        assert!(
            reason.starts_with("Repeated action pattern 7 times without progress:"),
            "got: {}",
            reason
        );
    }

    #[test]
    fn test_varied_actions_are_productive() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        detector.record_action(&mut bead, read_action("a.go"));
        detector.record_action(&mut bead, read_action("b.go"));
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "edit_file").with_data("file_path", "c.go"),
        );
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "run_tests").with_data("command", "go test"),
        );
        detector.record_action(&mut bead, read_action("d.go"));
        detector.record_action(
            &mut bead,
            ActionRecord::new("agent-1", "bash").with_data("command", "git status"),
        );
        backdate_progress(&mut bead, 10);

        let (stuck, reason) = detector.is_stuck_in_loop(&bead);
        assert!(!stuck, "unexpected: {}", reason);
        assert!(reason.is_empty());
    }

    #[test]
    fn test_recent_progress_suppresses_detection() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        for _ in 0..7 {
            detector.record_action(&mut bead, read_action("test.go"));
        }
        // record_action just set last_progress to now

        let (stuck, _) = detector.is_stuck_in_loop(&bead);
        assert!(!stuck);
    }

    #[test]
    fn test_progress_window_boundary() {
        let detector = LoopDetector::new();
        let mut bead = bead();
        for _ in 0..7 {
            detector.record_action(&mut bead, read_action("test.go"));
        }

        let now = Utc::now();
        bead.context.progress_metrics.last_progress = Some(now - Duration::seconds(299));
        assert!(!detector.is_stuck_at(&bead, now).0);

        bead.context.progress_metrics.last_progress = Some(now - Duration::seconds(300));
        assert!(detector.is_stuck_at(&bead, now).0);
    }

    #[test]
    fn test_insufficient_history_is_never_stuck() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        // threshold 3 requires at least 6 actions; 5 repeats are tolerated
        for _ in 0..5 {
            detector.record_action(&mut bead, read_action("test.go"));
        }
        backdate_progress(&mut bead, 10);

        let (stuck, _) = detector.is_stuck_in_loop(&bead);
        assert!(!stuck);
    }

    #[test]
    fn test_runs_below_threshold_are_not_stuck() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        // Six actions, no run longer than two
        for i in 0..3 {
            detector.record_action(&mut bead, read_action(&format!("a{}.go", i)));
            detector.record_action(&mut bead, read_action(&format!("a{}.go", i)));
        }
        backdate_progress(&mut bead, 10);

        let (stuck, _) = detector.is_stuck_in_loop(&bead);
        assert!(!stuck);
    }

    #[test]
    fn test_tie_break_prefers_most_recent_run() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        for _ in 0..3 {
            detector.record_action(&mut bead, read_action("early.go"));
        }
        for _ in 0..3 {
            detector.record_action(&mut bead, read_action("late.go"));
        }
        backdate_progress(&mut bead, 10);

        let (stuck, reason) = detector.is_stuck_in_loop(&bead);
        assert!(stuck);
        let late_key = LoopDetector::progress_key(&read_action("late.go"));
        assert!(reason.ends_with(&late_key), "got: {}", reason);
    }

    #[test]
    fn test_threshold_clamping() {
        assert_eq!(LoopDetector::with_repeat_threshold(0).repeat_threshold(), 2);
        assert_eq!(LoopDetector::with_repeat_threshold(1).repeat_threshold(), 2);
        assert_eq!(LoopDetector::with_repeat_threshold(5).repeat_threshold(), 5);
    }

    #[test]
    fn test_reset_progress() {
        let detector = LoopDetector::new();
        let mut bead = bead();

        detector.record_action(&mut bead, read_action("a.rs"));
        assert_ne!(detector.progress_summary(&bead), "No progress data");

        detector.reset_progress(&mut bead);
        assert!(bead.context.action_history.is_empty());
        assert_eq!(detector.progress_summary(&bead), "No progress data");
    }
}
