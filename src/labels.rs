use serde::{Deserialize, Serialize};

/// Number of severity grades the classifier head produces.
pub const NUM_CLASSES: usize = 5;

/// Class names in head order.
pub const CLASS_LABELS: [&str; NUM_CLASSES] = [
    "No DR",
    "Mild",
    "Moderate",
    "Severe",
    "Proliferative DR",
];

const FALLBACK_RECOMMENDATION: &str =
    "Consult a qualified eye care professional for a comprehensive evaluation.";

/// Ordinal diabetic-retinopathy severity grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DrGrade {
    NoDr,
    Mild,
    Moderate,
    Severe,
    Proliferative,
}

impl DrGrade {
    pub const ALL: [DrGrade; NUM_CLASSES] = [
        DrGrade::NoDr,
        DrGrade::Mild,
        DrGrade::Moderate,
        DrGrade::Severe,
        DrGrade::Proliferative,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_label(label: &str) -> Option<Self> {
        CLASS_LABELS
            .iter()
            .position(|l| *l == label)
            .and_then(Self::from_index)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        CLASS_LABELS[self.index()]
    }

    pub fn risk(self) -> RiskLevel {
        match self {
            DrGrade::NoDr => RiskLevel::Low,
            DrGrade::Mild => RiskLevel::Medium,
            DrGrade::Moderate => RiskLevel::High,
            DrGrade::Severe | DrGrade::Proliferative => RiskLevel::Critical,
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            DrGrade::NoDr => {
                "No signs of DR detected. Maintain routine eye exams and glycemic control."
            }
            DrGrade::Mild => {
                "Mild indications present. Schedule a follow-up screening and monitor glucose levels."
            }
            DrGrade::Moderate => {
                "Moderate NPDR likely. Consult an ophthalmologist and manage glucose/BP/cholesterol."
            }
            DrGrade::Severe => "Severe NPDR suspected. Seek prompt specialist evaluation.",
            DrGrade::Proliferative => {
                "Proliferative DR suspected. Urgent ophthalmological care recommended."
            }
        }
    }
}

impl std::fmt::Display for DrGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Business risk tier reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

/// Risk tier for a label string. Labels outside the fixed set map to `Unknown`.
pub fn risk_for_label(label: &str) -> RiskLevel {
    DrGrade::from_label(label)
        .map(DrGrade::risk)
        .unwrap_or(RiskLevel::Unknown)
}

/// Recommendation text for a label string, with a generic fallback.
pub fn recommendation_for_label(label: &str) -> &'static str {
    DrGrade::from_label(label)
        .map(DrGrade::recommendation)
        .unwrap_or(FALLBACK_RECOMMENDATION)
}
