//! Modification expressions. This is how the policy state machine expresses
//! the attribute changes it wants applied to an entry. These are expressed as
//! "states" on what attribute-values should appear as within the `Entry`; the
//! caller applies them through its normal single-writer update path.

use std::slice;

use serde::{Deserialize, Serialize};

use crate::entry::{Attribute, Entry};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Modify {
    // This value *should* exist.
    Present(Attribute, String),
    // This value *should not* exist.
    Removed(Attribute, String),
    // This attr *should not* exist.
    Purged(Attribute),
}

pub fn m_pres(attr: Attribute, v: &str) -> Modify {
    Modify::Present(attr, v.to_string())
}

pub fn m_remove(attr: Attribute, v: &str) -> Modify {
    Modify::Removed(attr, v.to_string())
}

pub fn m_purge(attr: Attribute) -> Modify {
    Modify::Purged(attr)
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyList {
    // The order of this list matters. Each change must be done in order.
    mods: Vec<Modify>,
}

impl ModifyList {
    pub fn new() -> Self {
        ModifyList {
            mods: Vec::with_capacity(0),
        }
    }

    pub fn new_list(mods: Vec<Modify>) -> Self {
        ModifyList { mods }
    }

    pub fn push_mod(&mut self, modify: Modify) {
        self.mods.push(modify)
    }

    /// Drop any previously queued change to this attribute. Used when a later
    /// decision supersedes an earlier queued one within the same operation.
    pub fn retract_attr(&mut self, attr: Attribute) {
        self.mods.retain(|m| match m {
            Modify::Present(a, _) | Modify::Removed(a, _) | Modify::Purged(a) => *a != attr,
        });
    }

    pub fn iter(&self) -> slice::Iter<'_, Modify> {
        self.mods.iter()
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    /// Apply in order to an in-memory entry. This is what direct-update mode
    /// uses, and what the entry store does on the caller's behalf otherwise.
    pub fn apply_to(&self, entry: &mut Entry) {
        for m in &self.mods {
            match m {
                Modify::Present(attr, v) => entry.add_ava(*attr, v.clone()),
                Modify::Removed(attr, v) => entry.remove_ava_value(*attr, v),
                Modify::Purged(attr) => entry.purge_ava(*attr),
            }
        }
    }
}

impl<'a> IntoIterator for &'a ModifyList {
    type IntoIter = slice::Iter<'a, Modify>;
    type Item = &'a Modify;

    fn into_iter(self) -> Self::IntoIter {
        self.mods.iter()
    }
}
