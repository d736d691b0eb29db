//! System-prompt composition.
//!
//! The prompt is a preset base plus append-only layers: app-builder domain
//! knowledge, the curated-component catalogue, the planning workflow, tool
//! usage rules, and (when configured) a data-platform exploration preamble.
//! Composition happens once, at agent initialization, and stays fixed for the
//! life of the agent session.

use crate::config::RuntimeConfig;
use crate::scaffold::CuratedComponent;
use crate::subagents::SubAgentRegistry;

const BASE_PRESET: &str = "\
You are a senior software engineer building web applications inside a \
per-session sandbox. Work incrementally, verify your changes, and keep \
responses concise.";

const APP_BUILDER_CONTEXT: &str = "\
## App Builder Context

You build data-driven web applications in a sandboxed Next.js + TypeScript + \
Tailwind workspace. Prefer Edit over Write for existing files, keep data \
samples small, and never repeat information already in context.";

const PLANNING_WORKFLOW: &str = "\
## Workflow

0. Discover: for data apps, delegate to the `data-explorer` sub-agent first \
and confirm requirements with the user before building.
1. Create files with Write; modify existing files with Edit.
2. Verify with `npm run build` via Bash.
3. If the build fails, delegate to `code-reviewer`, then `error-fixer`.
4. Request a security review and call `mark-security-review-passed` once it \
is clean.
5. Start the preview with `start-dev-server` and share the returned URL.";

const TOOL_RULES: &str = "\
## Tool Rules

- All file paths are relative to the workspace root; the sandbox rejects \
anything outside it.
- NEVER start the dev server through Bash: it would collide with the \
frontend's port. Always use `start-dev-server`, which picks the session's \
allocated port and returns the preview URL.
- `start-dev-server` is blocked until a security review has passed.
- Long-running commands must set `background: true` so the session can \
supervise them.";

const DATA_PLATFORM_PREAMBLE: &str = "\
## Data Platform Access

The workspace environment carries credentials for the user's data platform. \
Explore available tables before building, request JSON output from the \
platform APIs, page through large tables instead of raising limits, and \
never hard-code credentials into generated files — read them from the \
environment.";

/// Assembles the full system prompt for an agent session.
pub fn compose(
    config: &RuntimeConfig,
    registry: &SubAgentRegistry,
    curated: &[CuratedComponent],
) -> String {
    let mut prompt = String::from(BASE_PRESET);
    push_section(&mut prompt, APP_BUILDER_CONTEXT);
    push_section(&mut prompt, &curated_catalogue(curated));
    push_section(&mut prompt, PLANNING_WORKFLOW);
    push_section(&mut prompt, TOOL_RULES);
    push_section(&mut prompt, &subagent_catalogue(registry));
    if config.data_platform {
        push_section(&mut prompt, DATA_PLATFORM_PREAMBLE);
    }
    prompt
}

fn push_section(prompt: &mut String, section: &str) {
    prompt.push_str("\n\n");
    prompt.push_str(section);
}

fn curated_catalogue(curated: &[CuratedComponent]) -> String {
    if curated.is_empty() {
        return "## Curated Components\n\nNo curated components are installed; generate \
                components from scratch."
            .to_string();
    }
    let mut section = String::from(
        "## Curated Components\n\nPrefer these before generating new components \
         (sources under `curated/`):\n",
    );
    for component in curated {
        section.push_str(&format!(
            "- `{}` ({}): {}. Use when: {}.\n",
            component.name,
            component.path,
            component.description,
            component.use_when.join("; "),
        ));
    }
    section
}

fn subagent_catalogue(registry: &SubAgentRegistry) -> String {
    let mut section = String::from(
        "## Sub-agents\n\nDelegate via the Task tool; each runs with a restricted \
         tool set:\n",
    );
    for name in registry.names() {
        if let Some(profile) = registry.get(name) {
            section.push_str(&format!("- `{}`: {}\n", profile.name, profile.description));
        }
    }
    section
}
