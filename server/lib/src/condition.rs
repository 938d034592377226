//! Tri-state condition memoisation. The password policy state machine caches
//! every predicate it evaluates as one of these so that repeated queries
//! within one operation are O(1) after the first evaluation.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    True,
    False,
    #[default]
    Unknown,
}

impl Condition {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Condition::True
        } else {
            Condition::False
        }
    }

    /// None while the predicate has not been evaluated.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Condition::True => Some(true),
            Condition::False => Some(false),
            Condition::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Condition::Unknown)
    }

    /// Explicit invalidation, for mutations that could change the answer.
    pub fn reset(&mut self) {
        *self = Condition::Unknown;
    }
}
