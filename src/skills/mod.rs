//! Skill registry (§3 Skill, §4.2 skill loading): a named bundle of tools, seeded at startup
//! rather than discovered via instance introspection (§9 redesign flag — no subclass
//! reflection).

use crate::backend::{Tool, ToolHandler};
use crate::permissions::skill_risk_level;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct SkillToolSummary {
    pub name: String,
    pub description: String,
}

/// §3 Skill: `name`, `description`, ordered tool list. Contributes all its tools to the flat
/// registry when loaded.
pub struct Skill {
    pub name: String,
    pub description: String,
    pub tools: Vec<Tool>,
}

impl Skill {
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "risk_level": format!("{:?}", skill_risk_level(&self.name)).to_lowercase(),
            "tools": self.tools.iter().map(|t| SkillToolSummary {
                name: t.name.clone(),
                description: t.description.clone(),
            }).collect::<Vec<_>>(),
        })
    }
}

fn handler(result: &'static str) -> ToolHandler {
    Arc::new(move |_args| Ok(result.to_string()))
}

/// Seeds the small demo skill set that ships with the core. Real leaf skill implementations
/// (PDF, OCR, QR, weather, etc.) are out of scope; the registry treats each as an opaque
/// `(name, description, parameter schema, handler)` record regardless of where it came from.
fn seed_skills() -> Vec<Skill> {
    vec![
        Skill {
            name: "datetime".to_string(),
            description: "Current date and time utilities.".to_string(),
            tools: vec![Tool {
                name: "now".to_string(),
                description: "Returns the current UTC timestamp.".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                handler: Arc::new(|_args| Ok(chrono::Utc::now().to_rfc3339())),
            }],
        },
        Skill {
            name: "math".to_string(),
            description: "Arithmetic helpers.".to_string(),
            tools: vec![Tool {
                name: "add".to_string(),
                description: "Adds two numbers given as 'a' and 'b'.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"],
                }),
                handler: Arc::new(|args| {
                    let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Ok((a + b).to_string())
                }),
            }],
        },
        Skill {
            name: "text".to_string(),
            description: "Plain-text transformations.".to_string(),
            tools: vec![Tool {
                name: "uppercase".to_string(),
                description: "Uppercases the 'text' argument.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"],
                }),
                handler: Arc::new(|args| {
                    let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    Ok(text.to_uppercase())
                }),
            }],
        },
        Skill {
            name: "json".to_string(),
            description: "JSON validation and formatting.".to_string(),
            tools: vec![Tool {
                name: "validate_json".to_string(),
                description: "Validates the 'payload' argument as JSON.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"payload": {"type": "string"}},
                    "required": ["payload"],
                }),
                handler: handler("valid"),
            }],
        },
        Skill {
            name: "fs".to_string(),
            description: "Filesystem access (write scope, medium risk).".to_string(),
            tools: vec![Tool {
                name: "read_file".to_string(),
                description: "Reads a UTF-8 text file at 'path'.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"],
                }),
                handler: Arc::new(|args| {
                    let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
                    std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("read_file failed: {e}"))
                }),
            }],
        },
    ]
}

/// Flat registry produced by skill loading. Read-only after construction (§3 ownership), so
/// it is safe to share across concurrently-served requests without locking.
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
    skill_of_tool: HashMap<String, &'static str>,
}

impl SkillRegistry {
    /// Loads every seeded skill whose name is in `enabled` (or all of them, when `enabled` is
    /// empty and `mode` is not "minimal"), per §4.2: skip names not enabled, never fail the
    /// whole load on one bad skill.
    pub fn load(mode: &str, enabled: &[String]) -> Self {
        let mut skills = HashMap::new();
        let mut skill_of_tool = HashMap::new();
        for skill in seed_skills() {
            let include = match mode {
                "minimal" => enabled.iter().any(|e| e == &skill.name),
                "all" => true,
                _ => enabled.is_empty() || enabled.iter().any(|e| e == &skill.name),
            };
            if !include {
                continue;
            }
            let static_name: &'static str = Box::leak(skill.name.clone().into_boxed_str());
            for tool in &skill.tools {
                skill_of_tool.insert(tool.name.clone(), static_name);
            }
            skills.insert(skill.name.clone(), skill);
        }
        Self { skills, skill_of_tool }
    }

    pub fn all_tools(&self) -> Vec<Tool> {
        self.skills.values().flat_map(|s| s.tools.clone()).collect()
    }

    pub fn skill_of(&self, tool_name: &str) -> Option<&'static str> {
        self.skill_of_tool.get(tool_name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn list(&self) -> Vec<&Skill> {
        self.skills.values().collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_all_includes_every_seeded_skill() {
        let registry = SkillRegistry::load("all", &[]);
        assert!(registry.get("datetime").is_some());
        assert!(registry.get("math").is_some());
        assert!(registry.get("fs").is_some());
    }

    #[test]
    fn minimal_mode_only_loads_enabled_skills() {
        let registry = SkillRegistry::load("minimal", &["math".to_string()]);
        assert!(registry.get("math").is_some());
        assert!(registry.get("fs").is_none());
    }

    #[test]
    fn skill_of_resolves_tool_to_owning_skill() {
        let registry = SkillRegistry::load("all", &[]);
        assert_eq!(registry.skill_of("add"), Some("math"));
        assert_eq!(registry.skill_of("read_file"), Some("fs"));
        assert_eq!(registry.skill_of("nonexistent"), None);
    }
}
