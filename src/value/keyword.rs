//! Interned domain symbols.
//!
//! A `Keyword` names an attribute or enumerated value (`:person/name`).
//! Interning maps each distinct name to a small id once; comparisons and
//! hashing use the id, ordering resolves back to the name so keyword order
//! matches name order. The table is append-only; `clear_keyword_interns`
//! is for test teardown only.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, OnceLock};

struct KeywordTable {
    by_name: DashMap<Arc<str>, u32>,
    names: RwLock<Vec<Arc<str>>>,
}

fn table() -> &'static KeywordTable {
    static TABLE: OnceLock<KeywordTable> = OnceLock::new();
    TABLE.get_or_init(|| KeywordTable {
        by_name: DashMap::new(),
        names: RwLock::new(Vec::new()),
    })
}

/// An interned domain symbol.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Keyword(u32);

impl Keyword {
    /// Intern a name. A leading `:` is accepted and stripped.
    pub fn intern(name: &str) -> Self {
        let name = name.strip_prefix(':').unwrap_or(name);
        let t = table();
        if let Some(id) = t.by_name.get(name) {
            return Keyword(*id);
        }
        let shared: Arc<str> = Arc::from(name);
        // Lock the id vector across the insert so ids stay dense even when
        // two threads race on the same fresh name.
        let mut names = t.names.write();
        if let Some(id) = t.by_name.get(name) {
            return Keyword(*id);
        }
        let id = names.len() as u32;
        names.push(Arc::clone(&shared));
        t.by_name.insert(shared, id);
        Keyword(id)
    }

    /// The interned name, without the leading `:`.
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&table().names.read()[self.0 as usize])
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl PartialOrd for Keyword {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Keyword {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            return Ordering::Equal;
        }
        self.name().cmp(&other.name())
    }
}

impl fmt::Debug for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl serde::Serialize for Keyword {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> serde::Deserialize<'de> for Keyword {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Keyword::intern(&name))
    }
}

/// Drop all interned keywords. Test teardown only: outstanding `Keyword`
/// values become dangling ids.
pub fn clear_keyword_interns() {
    let t = table();
    let mut names = t.names.write();
    t.by_name.clear();
    names.clear();
}
