//! Sub-agent registry.
//!
//! Named reasoning profiles the main agent can delegate to through the Task
//! tool. Each profile carries its own system prompt, a restricted tool
//! subset, and a model-tier hint; it shares the session's policy gate, hook
//! pipeline, and workspace with the main agent.

use std::collections::BTreeMap;

use crate::tools::ToolName;

/// Size/cost hint for the reasoning model backing a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Cheap and fast; exploration and review work.
    Small,
    /// Full-size model; code generation and fixes.
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Small => "small",
            ModelTier::Large => "large",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubAgentProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub system_prompt: &'static str,
    pub tools: Vec<ToolName>,
    pub tier: ModelTier,
}

impl SubAgentProfile {
    pub fn allows(&self, tool: ToolName) -> bool {
        self.tools.contains(&tool)
    }
}

#[derive(Debug, Clone)]
pub struct SubAgentRegistry {
    profiles: BTreeMap<&'static str, SubAgentProfile>,
}

impl SubAgentRegistry {
    pub fn get(&self, name: &str) -> Option<&SubAgentProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.profiles.keys().copied()
    }
}

impl Default for SubAgentRegistry {
    fn default() -> Self {
        let profiles = [
            SubAgentProfile {
                name: "data-explorer",
                description: "Discovers available data sources before building data apps.",
                system_prompt: concat!(
                    "You are a data discovery specialist. Check credentials first and ",
                    "exit gracefully if they are missing. List available sources, then ",
                    "for the most relevant ones report schemas and a handful of sample ",
                    "rows. Cap samples at 5 rows and report only essential findings.",
                ),
                tools: vec![ToolName::Bash],
                tier: ModelTier::Small,
            },
            SubAgentProfile {
                name: "code-reviewer",
                description: "Analyzes build errors and reviews generated code.",
                system_prompt: concat!(
                    "You are an expert TypeScript/React code reviewer. Read the error ",
                    "message carefully, use Grep with targeted patterns to locate the ",
                    "problem, and report each issue as `FILE: path:line`, `ISSUE: ...`, ",
                    "`FIX: ...`. Only report issues you are confident about.",
                ),
                tools: vec![ToolName::Read, ToolName::Grep, ToolName::Glob],
                tier: ModelTier::Small,
            },
            SubAgentProfile {
                name: "error-fixer",
                description: "Applies surgical fixes identified by the code reviewer.",
                system_prompt: concat!(
                    "You are a precise code fixer. Read only the relevant section of ",
                    "each file and apply minimal Edit changes, one fix at a time. State ",
                    "what changed in one line; do not explain further.",
                ),
                tools: vec![ToolName::Read, ToolName::Edit],
                tier: ModelTier::Large,
            },
            SubAgentProfile {
                name: "component-generator",
                description: "Creates React components with TypeScript and Tailwind.",
                system_prompt: concat!(
                    "You are a React component specialist. Generate typed components, ",
                    "use client directives only where state or effects require them, ",
                    "and prefer curated library components when the registry has a fit.",
                ),
                tools: vec![ToolName::Write, ToolName::Read],
                tier: ModelTier::Large,
            },
            SubAgentProfile {
                name: "planner",
                description: "Turns requirements into a concrete build plan.",
                system_prompt: concat!(
                    "You are a planning specialist. Produce a concise plan: pages, data ",
                    "sources, components from the curated registry, and custom ",
                    "components to generate. If critical requirements are missing, emit ",
                    "a line starting with NEEDS_CLARIFICATION followed by the questions.",
                ),
                tools: vec![ToolName::Read, ToolName::Glob, ToolName::Grep],
                tier: ModelTier::Large,
            },
            SubAgentProfile {
                name: "requirements-analyzer",
                description: "Extracts concrete requirements from the user's request.",
                system_prompt: concat!(
                    "You analyze a user's request and enumerate data and UI ",
                    "requirements as short bullet points, flagging anything ambiguous.",
                ),
                tools: vec![ToolName::Read, ToolName::Grep],
                tier: ModelTier::Small,
            },
            SubAgentProfile {
                name: "plan-validator",
                description: "Checks a build plan for gaps before building starts.",
                system_prompt: concat!(
                    "You validate build plans. Verify every page has a data source, ",
                    "every component exists in the registry or is scheduled for ",
                    "generation, and report gaps as a numbered list.",
                ),
                tools: vec![ToolName::Read],
                tier: ModelTier::Small,
            },
            SubAgentProfile {
                name: "security-reviewer",
                description: "Reviews generated code for security issues before preview.",
                system_prompt: concat!(
                    "You are a security reviewer. Inspect the generated application for ",
                    "injected secrets, unsafe HTML, unvalidated input reaching the ",
                    "filesystem or shell, and credential leaks to the client bundle. ",
                    "Report findings by severity; state clearly when nothing blocks ",
                    "the preview.",
                ),
                tools: vec![ToolName::Read, ToolName::Grep, ToolName::Glob],
                tier: ModelTier::Large,
            },
        ];
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name, profile))
                .collect(),
        }
    }
}
