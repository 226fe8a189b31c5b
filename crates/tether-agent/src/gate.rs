use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

/// Per-tool permission rule.
#[derive(Debug, Clone, Default)]
pub struct ToolRule {
    /// May this tool open a new chain (be the first call of a turn)?
    pub may_initiate: bool,
    /// Tools this one may invoke while it is the chain initiator.
    pub allowed_tools: HashSet<String>,
}

impl ToolRule {
    pub fn initiator() -> Self {
        Self {
            may_initiate: true,
            allowed_tools: HashSet::new(),
        }
    }

    pub fn with_allowed<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools.extend(tools.into_iter().map(Into::into));
        self
    }
}

/// Decides whether a requested tool may execute in the current chain.
///
/// Policy: unknown tools are denied; with no chain active a tool needs its
/// may-initiate flag; the initiator may recurse into itself; anything else
/// must be in the initiator's allowed set.
pub struct PermissionGate {
    rules: HashMap<String, ToolRule>,
    initiator: Mutex<Option<String>>,
}

impl PermissionGate {
    pub fn new(rules: HashMap<String, ToolRule>) -> Self {
        Self {
            rules,
            initiator: Mutex::new(None),
        }
    }

    /// Permissive default: every registered tool may initiate a chain and
    /// call any other registered tool.
    pub fn allow_all<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let names: Vec<String> = names.into_iter().map(String::from).collect();
        let rules = names
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    ToolRule::initiator().with_allowed(names.iter().cloned()),
                )
            })
            .collect();
        Self::new(rules)
    }

    pub fn is_allowed(&self, tool: &str) -> bool {
        let Some(rule) = self.rules.get(tool) else {
            debug!(tool, "denying unknown tool");
            return false;
        };
        let initiator = self.initiator.lock().unwrap();
        match initiator.as_deref() {
            None => rule.may_initiate,
            Some(current) if current == tool => true,
            Some(current) => self
                .rules
                .get(current)
                .map(|r| r.allowed_tools.contains(tool))
                .unwrap_or(false),
        }
    }

    /// Set (or clear) the current chain initiator.
    pub fn start_chain(&self, tool: Option<&str>) {
        *self.initiator.lock().unwrap() = tool.map(String::from);
    }

    /// Called before each user turn.
    pub fn reset_chain(&self) {
        self.start_chain(None);
    }

    pub fn current_initiator(&self) -> Option<String> {
        self.initiator.lock().unwrap().clone()
    }
}
