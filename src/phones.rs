//! Phone label interning. The dictionary, the HMM inventory and the network
//! builder all talk about phones; interning the labels once means the rest of
//! the code can compare and hash cheap copyable ids instead of strings.
use std::collections::HashMap;
use std::fmt;

/// Interned phone label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhoneId(pub u32);

/// Two-way mapping between phone strings and [`PhoneId`]s.
#[derive(Debug, Default, Clone)]
pub struct PhoneTable {
    names: Vec<String>,
    index: HashMap<String, PhoneId>,
}

impl PhoneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a label, returning the existing id if it has been seen before.
    pub fn intern(&mut self, name: &str) -> PhoneId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = PhoneId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    /// Look up a label without interning it.
    pub fn lookup(&self, name: &str) -> Option<PhoneId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: PhoneId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for PhoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ph{}", self.0)
    }
}
