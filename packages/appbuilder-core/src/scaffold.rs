//! Workspace scaffolding.
//!
//! A fresh workspace receives a project scaffold plus the curated component
//! library before the first user turn. Both can be overridden with on-disk
//! directories; the built-in fallbacks keep the runtime usable without any
//! external assets.

use std::fs;
use std::path::Path;

use appbuilder_error::BuilderError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::RuntimeConfig;

/// One entry in `curated/registry.json`, the catalogue the agent consults
/// before generating components from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuratedComponent {
    pub name: String,
    pub path: String,
    pub description: String,
    pub use_when: Vec<String>,
    pub features: Vec<String>,
}

/// Populates a freshly created workspace directory.
pub fn install(workspace: &Path, config: &RuntimeConfig) -> Result<(), BuilderError> {
    match &config.scaffold_dir {
        Some(dir) => copy_dir_recursive(dir, workspace)?,
        None => write_default_scaffold(workspace)?,
    }

    let curated = workspace.join("curated");
    match &config.curated_dir {
        Some(dir) => copy_dir_recursive(dir, &curated)?,
        None => write_default_curated(&curated)?,
    }
    Ok(())
}

/// Writes credentials the running preview needs into `.env.local` at the
/// workspace root. Called immediately before the dev server starts.
pub fn write_preview_env(workspace: &Path, pairs: &[(String, String)]) -> Result<(), BuilderError> {
    let mut body = String::new();
    for (key, value) in pairs {
        body.push_str(key);
        body.push('=');
        body.push_str(value);
        body.push('\n');
    }
    fs::write(workspace.join(".env.local"), body)?;
    Ok(())
}

fn write_default_scaffold(workspace: &Path) -> Result<(), BuilderError> {
    let package_json = json!({
        "name": "app",
        "private": true,
        "scripts": {
            "dev": "next dev",
            "build": "next build",
            "type-check": "tsc --noEmit"
        }
    });
    fs::write(
        workspace.join("package.json"),
        serde_json::to_string_pretty(&package_json)?,
    )?;

    // The preview is embedded in an iframe; the headers below keep Next.js
    // from refusing the embed.
    fs::write(
        workspace.join("next.config.js"),
        concat!(
            "/** @type {import('next').NextConfig} */\n",
            "const nextConfig = {\n",
            "  async headers() {\n",
            "    return [\n",
            "      {\n",
            "        source: '/:path*',\n",
            "        headers: [\n",
            "          { key: 'X-Frame-Options', value: 'ALLOWALL' },\n",
            "          { key: 'Content-Security-Policy', value: \"frame-ancestors 'self' http://localhost:* http://127.0.0.1:*\" },\n",
            "        ],\n",
            "      },\n",
            "    ];\n",
            "  },\n",
            "};\n",
            "\n",
            "module.exports = nextConfig;\n",
        ),
    )?;

    fs::create_dir_all(workspace.join("app"))?;
    fs::create_dir_all(workspace.join("components"))?;
    fs::create_dir_all(workspace.join("lib"))?;
    Ok(())
}

fn write_default_curated(curated: &Path) -> Result<(), BuilderError> {
    fs::create_dir_all(curated.join("components"))?;

    let registry = vec![
        CuratedComponent {
            name: "DataTable".to_string(),
            path: "curated/components/data-table.tsx".to_string(),
            description: "Sortable, paginated table for tabular records".to_string(),
            use_when: vec![
                "displaying rows of structured data".to_string(),
                "the user asks for a table or list view".to_string(),
            ],
            features: vec!["sorting".to_string(), "pagination".to_string()],
        },
        CuratedComponent {
            name: "StatCard".to_string(),
            path: "curated/components/stat-card.tsx".to_string(),
            description: "Single-metric summary card with label and delta".to_string(),
            use_when: vec!["showing a headline KPI".to_string()],
            features: vec!["delta badge".to_string()],
        },
    ];
    fs::write(
        curated.join("registry.json"),
        serde_json::to_string_pretty(&registry)?,
    )?;

    fs::write(
        curated.join("components").join("data-table.tsx"),
        concat!(
            "'use client'\n\n",
            "interface DataTableProps<T> {\n",
            "  rows: T[]\n",
            "  columns: { key: keyof T; label: string }[]\n",
            "}\n\n",
            "export default function DataTable<T>({ rows, columns }: DataTableProps<T>) {\n",
            "  return (\n",
            "    <table className=\"w-full text-sm\">\n",
            "      <thead>\n",
            "        <tr>{columns.map((c) => <th key={String(c.key)}>{c.label}</th>)}</tr>\n",
            "      </thead>\n",
            "      <tbody>\n",
            "        {rows.map((row, i) => (\n",
            "          <tr key={i}>{columns.map((c) => <td key={String(c.key)}>{String(row[c.key])}</td>)}</tr>\n",
            "        ))}\n",
            "      </tbody>\n",
            "    </table>\n",
            "  )\n",
            "}\n",
        ),
    )?;

    fs::write(
        curated.join("components").join("stat-card.tsx"),
        concat!(
            "interface StatCardProps {\n",
            "  label: string\n",
            "  value: string\n",
            "  delta?: string\n",
            "}\n\n",
            "export default function StatCard({ label, value, delta }: StatCardProps) {\n",
            "  return (\n",
            "    <div className=\"rounded-lg border p-4\">\n",
            "      <p className=\"text-sm text-muted-foreground\">{label}</p>\n",
            "      <p className=\"text-2xl font-semibold\">{value}</p>\n",
            "      {delta ? <p className=\"text-xs\">{delta}</p> : null}\n",
            "    </div>\n",
            "  )\n",
            "}\n",
        ),
    )?;
    Ok(())
}

pub(crate) fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<(), BuilderError> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
