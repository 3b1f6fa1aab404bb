/// Runtime configuration: documented properties persisted as plain
/// `property=value` text, read/written by the embedding host.
///
/// Grounded on `axm/src/conf.rs`'s `PropDef`/`Category`/`ALL_PROPS` shape
/// and its hand-written line parser — the teacher doesn't reach for
/// `toml`/`serde` for this particular file, and neither do we
/// (SPEC_FULL.md §A).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PropDef {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    pub performance_impact: &'static str,
    pub memory_impact: &'static str,
    pub category: Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Debug,
    Optimizer,
    Specialization,
    Pool,
    Scheduling,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub static ALL_PROPS: &[PropDef] = &[
    PropDef {
        name: "debug",
        default: "off",
        description: "Master debug switch: enables opcode tracing and extra runtime assertions.",
        performance_impact: "HIGH — disables specialization fast paths while on",
        memory_impact: "LOW",
        category: Category::Debug,
    },
    PropDef {
        name: "opcode_trace",
        default: "off",
        description: "Print each dispatched opcode and its resolved operands to stderr.",
        performance_impact: "EXTREME — I/O bound, only active when debug=on",
        memory_impact: "LOW",
        category: Category::Debug,
    },
    PropDef {
        name: "specialization_observation_count",
        default: "1",
        description: "Executions of a specializable instruction before building a SpecializedHandler (spec 4.3).",
        performance_impact: "Higher values delay warm-up but reduce thrash on sites with an unstable initial shape.",
        memory_impact: "LOW",
        category: Category::Specialization,
    },
    PropDef {
        name: "deadline_check_interval",
        default: "4096",
        description: "Number of instructions the VM executes between deadline/cancellation checks in RunFor (spec 5).",
        performance_impact: "Lower values increase responsiveness to Stop()/deadlines at a small dispatch-loop cost.",
        memory_impact: "LOW",
        category: Category::Scheduling,
    },
    PropDef {
        name: "frame_pool_capacity",
        default: "256",
        description: "Maximum number of call frames kept in the free list before extras are dropped on return.",
        performance_impact: "Higher values avoid reallocation in deeply recursive or call-heavy programs.",
        memory_impact: "MEDIUM — each pooled frame retains its register array's backing allocation",
        category: Category::Pool,
    },
    PropDef {
        name: "iterator_pool_capacity",
        default: "64",
        description: "Maximum number of iterator objects kept in the free list.",
        performance_impact: "LOW",
        memory_impact: "LOW",
        category: Category::Pool,
    },
    PropDef {
        name: "optimize_fuse_goto_conditionals",
        default: "on",
        description: "Enable the FuseGotoConditionals peephole pass.",
        performance_impact: "Disabling increases dispatched instruction count for every comparison-then-branch.",
        memory_impact: "NONE",
        category: Category::Optimizer,
    },
    PropDef {
        name: "optimize_remove_const_temp_registers",
        default: "on",
        description: "Enable constant folding over single-assign temp registers.",
        performance_impact: "Disabling keeps redundant constant-load instructions in the final bytecode.",
        memory_impact: "NONE",
        category: Category::Optimizer,
    },
];

pub fn lookup(name: &str) -> Option<&'static PropDef> {
    ALL_PROPS.iter().find(|p| p.name == name)
}

/// Parsed configuration: `name -> value`, overlaid on `ALL_PROPS`'
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct FluenceConf {
    values: HashMap<String, String>,
}

impl FluenceConf {
    pub fn defaults() -> Self {
        let values = ALL_PROPS.iter().map(|p| (p.name.to_string(), p.default.to_string())).collect();
        FluenceConf { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some("on") | Some("true") | Some("1"))
    }

    pub fn get_usize(&self, name: &str, fallback: usize) -> usize {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(fallback)
    }

    /// Parse `property=value` lines; `#` starts a comment, blank lines
    /// are ignored (teacher's format exactly, `axm/src/conf.rs`).
    pub fn parse(text: &str) -> Self {
        let mut conf = FluenceConf::defaults();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                conf.set(key.trim(), value.trim());
            }
        }
        conf
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for prop in ALL_PROPS {
            if let Some(value) = self.values.get(prop.name) {
                out.push_str(&format!("{}={}\n", prop.name, value));
            }
        }
        out
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs_home().map(|home| home.join(".fluence").join("conf.txt"))
    }
}

/// Minimal home-directory lookup so this module doesn't need the `dirs`
/// crate just for one path join (the rest of Fluence's ambient stack
/// doesn't touch the filesystem beyond this).
fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_properties_fall_back_to_their_documented_default() {
        let conf = FluenceConf::defaults();
        assert_eq!(conf.get("debug"), Some("off"));
        assert_eq!(conf.get_usize("deadline_check_interval", 0), 4096);
    }

    #[test]
    fn parse_overrides_defaults_and_ignores_comments() {
        let conf = FluenceConf::parse("# a comment\ndebug=on\n\nspecialization_observation_count=3\n");
        assert!(conf.get_bool("debug"));
        assert_eq!(conf.get_usize("specialization_observation_count", 0), 3);
    }

    #[test]
    fn render_round_trips_through_parse() {
        let mut conf = FluenceConf::defaults();
        conf.set("debug", "on");
        let text = conf.render();
        let reparsed = FluenceConf::parse(&text);
        assert!(reparsed.get_bool("debug"));
    }
}
