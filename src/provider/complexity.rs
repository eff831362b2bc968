use serde::{Deserialize, Serialize};

/// Coarse task difficulty used to route beads to an appropriately sized
/// model. Ordered so `max` of two estimates is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Simple,
    Medium,
    Complex,
    Extended,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Extended => "extended",
        }
    }

    /// Smallest model tier that can handle this complexity.
    pub fn required_tier(&self) -> ModelTier {
        match self {
            Self::Simple => ModelTier::Small,
            Self::Medium => ModelTier::Medium,
            Self::Complex => ModelTier::Large,
            Self::Extended => ModelTier::XLarge,
        }
    }
}

impl std::fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability tier derived from parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
    XLarge,
}

impl ModelTier {
    pub fn from_params_b(params_b: f64) -> Self {
        if params_b <= 7.0 {
            Self::Small
        } else if params_b <= 40.0 {
            Self::Medium
        } else if params_b <= 100.0 {
            Self::Large
        } else {
            Self::XLarge
        }
    }
}

/// A model at tier T handles any complexity whose required tier is <= T.
pub fn is_model_sufficient(params_b: f64, complexity: ComplexityLevel) -> bool {
    ModelTier::from_params_b(params_b) >= complexity.required_tier()
}

// Keyword groups checked in descending-severity order; the first group with a
// hit wins. Simple is checked before Medium so "fix typo" stays simple even
// though "fix" alone reads as medium work.
const EXTENDED_KEYWORDS: &[&str] = &[
    "extended thinking",
    "root cause",
    "formal verification",
    "audit",
    "prove",
    "critical",
    "irreversible",
    "high stakes",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "design",
    "architect",
    "evaluate",
    "trade-off",
    "tradeoff",
    "strategy",
    "plan",
    "scalability",
    "migration plan",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "format",
    "typo",
    "list",
    "lint",
    "remove unused",
    "review",
    "validate",
    "check",
    "summarize",
    "cleanup",
    "spelling",
];

const MEDIUM_KEYWORDS: &[&str] = &[
    "implement",
    "integrate",
    "refactor",
    "fix",
    "bug",
    "add tests",
    "unit tests",
    "test",
    "endpoint",
    "webhook",
];

/// Classifies bead text and type tags into complexity levels. Stateless; the
/// dispatcher combines both estimates by taking the maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityEstimator;

impl ComplexityEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Keyword-pattern scoring over title + description.
    pub fn estimate(&self, title: &str, description: &str) -> ComplexityLevel {
        let text = format!("{} {}", title, description).to_lowercase();

        if Self::any_match(&text, EXTENDED_KEYWORDS) {
            return ComplexityLevel::Extended;
        }
        if Self::any_match(&text, COMPLEX_KEYWORDS) {
            return ComplexityLevel::Complex;
        }
        if Self::any_match(&text, SIMPLE_KEYWORDS) {
            return ComplexityLevel::Simple;
        }
        if Self::any_match(&text, MEDIUM_KEYWORDS) {
            return ComplexityLevel::Medium;
        }

        ComplexityLevel::Medium
    }

    /// Estimate from the bead's type tag alone. Unknown tags default to
    /// medium.
    pub fn estimate_from_bead_type(&self, bead_type: &str) -> ComplexityLevel {
        match bead_type.to_lowercase().as_str() {
            "chore" | "docs" | "style" => ComplexityLevel::Simple,
            "bug" | "fix" | "test" | "feature" | "enhancement" => ComplexityLevel::Medium,
            "design" | "architecture" | "rfc" => ComplexityLevel::Complex,
            "decision" | "critical" => ComplexityLevel::Extended,
            _ => ComplexityLevel::Medium,
        }
    }

    /// The stronger of the two signals wins.
    pub fn combine(&self, type_level: ComplexityLevel, content_level: ComplexityLevel) -> ComplexityLevel {
        type_level.max(content_level)
    }

    /// Full classification for a bead: max of type-derived and content-derived.
    pub fn estimate_for_bead(
        &self,
        bead_type: &str,
        title: &str,
        description: &str,
    ) -> ComplexityLevel {
        self.combine(
            self.estimate_from_bead_type(bead_type),
            self.estimate(title, description),
        )
    }

    fn any_match(text: &str, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| text.contains(k))
    }
}
