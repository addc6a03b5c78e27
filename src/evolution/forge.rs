//! Tool Forge
//!
//! Synthesizes new tools: router-generated (or caller-supplied) Rust
//! source is parse-validated, statically screened against a forbidden
//! pattern list, wrapped in a self-contained module template, compiled
//! with `rustc`, and registered in both the `tools` table and the
//! on-disk `_registry.json`. Generated tools read a JSON object from
//! stdin and write a JSON object to stdout; the runtime executes them
//! as separate processes.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::diagnosis::analyzer;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::router::ModelRouter;
use crate::types::{outcome, CapabilityStatus, EventKind, TaskComplexity, ToolRecord};

/// Source fragments that fail the safety screen. The screen runs over
/// the tool body before wrapping; the template itself only touches
/// stdin and stdout.
pub const FORBIDDEN_PATTERNS: &[&str] = &[
    "std::process",
    "Command::new",
    "std::fs",
    "std::net",
    "TcpStream",
    "UdpSocket",
    "std::env",
    "env!",
    "unsafe",
    "include!",
    "include_str!",
    "include_bytes!",
    "std::ptr",
    "transmute",
    "libloading",
    "libc::",
    "asm!",
];

const REGISTRY_FILE: &str = "_registry.json";

pub struct ToolForge {
    journal: Arc<Journal>,
    router: Arc<ModelRouter>,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    tools_dir: PathBuf,
    creation_cost: f64,
    /// Serializes forges so two creations of the same name cannot race.
    forge_lock: Mutex<()>,
}

impl ToolForge {
    pub fn new(
        journal: Arc<Journal>,
        router: Arc<ModelRouter>,
        ledger: Arc<Ledger>,
        bus: Arc<EventBus>,
        tools_dir: PathBuf,
        creation_cost: f64,
    ) -> Result<Self> {
        fs::create_dir_all(tools_dir.join("bin"))
            .with_context(|| format!("failed to create tools dir {}", tools_dir.display()))?;
        Ok(Self {
            journal,
            router,
            ledger,
            bus,
            tools_dir,
            creation_cost,
            forge_lock: Mutex::new(()),
        })
    }

    pub fn tools_dir(&self) -> &PathBuf {
        &self.tools_dir
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.tools_dir.join(format!("{name}.rs"))
    }

    fn binary_path(&self, name: &str) -> PathBuf {
        self.tools_dir.join("bin").join(name)
    }

    fn registry_path(&self) -> PathBuf {
        self.tools_dir.join(REGISTRY_FILE)
    }

    // ─── Creation ────────────────────────────────────────────────

    /// Create a tool. When `code` is absent the coding backend is asked
    /// for the body. On any validation failure nothing is written: no
    /// file, no table row, no registry entry.
    pub async fn create_tool(
        &self,
        name: &str,
        description: &str,
        code: Option<String>,
    ) -> Result<ToolRecord> {
        validate_tool_name(name)?;

        if self.journal.get_tool(name)?.is_some() {
            return Err(CoreError::validation(format!("tool '{name}' already exists")).into());
        }

        let body = match code {
            Some(code) => strip_code_fences(&code),
            None => {
                let generated = self.generate_code(name, description).await?;
                strip_code_fences(&generated)
            }
        };

        validate_tool_body(&body)?;

        // From here on the forge mutates the filesystem; serialize.
        let _guard = self.forge_lock.lock().unwrap();

        let source = wrap_in_template(name, description, &body);
        let source_path = self.source_path(name);
        let binary_path = self.binary_path(name);

        fs::write(&source_path, &source)
            .with_context(|| format!("failed to write {}", source_path.display()))?;

        if let Err(e) = compile_tool(&source_path, &binary_path) {
            let _ = fs::remove_file(&source_path);
            self.journal.log_action(
                "tool_forge",
                &format!("compilation of '{name}' failed: {e:#}"),
                outcome::ERROR,
                0.0,
            )?;
            return Err(e);
        }

        let record = match self
            .journal
            .insert_tool(name, description, &source_path.to_string_lossy())
        {
            Ok(record) => record,
            Err(e) => {
                let _ = fs::remove_file(&source_path);
                let _ = fs::remove_file(&binary_path);
                return Err(e);
            }
        };
        self.write_registry()?;

        self.journal.upsert_capability(
            name,
            description,
            5,
            5,
            &json!([]),
            CapabilityStatus::Developed,
        )?;
        self.journal.mark_capability_developed(name)?;

        if self.creation_cost > 0.0 {
            self.ledger
                .charge(&format!("tool forge: {name}"), self.creation_cost, "tooling")?;
        }

        self.journal.log_action(
            "tool_forge",
            &format!("created tool '{name}': {description}"),
            outcome::COMPLETED,
            self.creation_cost,
        )?;
        self.bus.publish(
            EventKind::ToolCreated,
            json!({ "name": name, "path": record.file_path }),
            "forge",
        );
        info!(tool = name, "tool forged");

        Ok(record)
    }

    async fn generate_code(&self, name: &str, description: &str) -> Result<String> {
        let prompt = format!(
            "Write a single Rust function for a tool named '{name}'.\n\
             Purpose: {description}\n\
             Requirements:\n\
             - exact signature: fn execute(args: &str) -> String\n\
             - `args` is a JSON object encoded as text; return a JSON object encoded as text\n\
             - use only the standard library, and do not touch the filesystem, network, \
               process, or environment APIs\n\
             - no main function, no comments, no markdown\n\
             Respond with only the code."
        );
        self.router
            .call_routed("coding", TaskComplexity::High, &prompt, FORGE_PROMPT)
            .await
    }

    // ─── Execution ───────────────────────────────────────────────

    /// Run a tool's compiled artifact, passing `args` as JSON on stdin
    /// and parsing stdout as JSON. Bumps the usage counters on success.
    pub fn execute_tool(&self, name: &str, args: &Value) -> Result<Value> {
        let record = self
            .journal
            .get_tool(name)?
            .ok_or_else(|| CoreError::validation(format!("unknown tool: {name}")))?;

        let binary = self.binary_path(&record.name);
        let run = || -> Result<Value> {
            let mut child = Command::new(&binary)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("failed to spawn {}", binary.display()))?;

            child
                .stdin
                .as_mut()
                .context("tool stdin unavailable")?
                .write_all(serde_json::to_string(args)?.as_bytes())?;

            let output = child.wait_with_output()?;
            if !output.status.success() {
                anyhow::bail!(
                    "tool exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            serde_json::from_str(stdout.trim())
                .with_context(|| format!("tool '{name}' wrote invalid JSON"))
        };

        match run() {
            Ok(value) => {
                self.journal.touch_tool(name)?;
                self.bus
                    .publish(EventKind::ToolLoaded, json!({ "name": name }), "forge");
                Ok(value)
            }
            Err(e) => {
                self.journal.log_action(
                    "tool_execution",
                    &format!("tool '{name}' failed: {e:#}"),
                    outcome::ERROR,
                    0.0,
                )?;
                self.bus.publish(
                    EventKind::ToolError,
                    json!({ "name": name, "error": format!("{e:#}") }),
                    "forge",
                );
                Err(e)
            }
        }
    }

    // ─── Removal & maintenance ───────────────────────────────────

    /// Remove a tool: table row, source, binary and registry entry go
    /// together.
    pub fn remove_tool(&self, name: &str) -> Result<bool> {
        let _guard = self.forge_lock.lock().unwrap();
        if !self.journal.delete_tool(name)? {
            return Ok(false);
        }
        let _ = fs::remove_file(self.source_path(name));
        let _ = fs::remove_file(self.binary_path(name));
        self.write_registry()?;
        self.journal.log_action(
            "tool_forge",
            &format!("removed tool '{name}'"),
            outcome::COMPLETED,
            0.0,
        )?;
        Ok(true)
    }

    /// Reconcile the registry with reality: drop table rows whose
    /// artifacts vanished and rewrite `_registry.json` from the table.
    pub fn sync_registry(&self) -> Result<String> {
        let _guard = self.forge_lock.lock().unwrap();
        let tools = self.journal.list_tools()?;
        let mut dropped = 0;
        for tool in &tools {
            if !self.source_path(&tool.name).exists() || !self.binary_path(&tool.name).exists() {
                warn!(tool = tool.name.as_str(), "artifact missing, dropping registration");
                self.journal.delete_tool(&tool.name)?;
                let _ = fs::remove_file(self.source_path(&tool.name));
                let _ = fs::remove_file(self.binary_path(&tool.name));
                dropped += 1;
            }
        }
        self.write_registry()?;
        let remaining = self.journal.tool_count()?;
        Ok(format!("{remaining} tools registered, {dropped} dropped"))
    }

    fn write_registry(&self) -> Result<()> {
        let tools = self.journal.list_tools()?;
        let registry: BTreeMap<String, Value> = tools
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "path": t.file_path,
                        "parameters": "json object on stdin",
                        "created_at": t.created_at,
                        "status": "active",
                    }),
                )
            })
            .collect();
        fs::write(
            self.registry_path(),
            serde_json::to_string_pretty(&registry)?,
        )
        .context("failed to write tool registry")?;
        Ok(())
    }
}

// ─── Validation helpers ──────────────────────────────────────────

/// Tool names must be plain lowercase identifiers.
pub fn validate_tool_name(name: &str) -> Result<()> {
    let pattern = Regex::new(r"^[a-z_][a-z0-9_]{0,63}$").expect("static regex");
    if !pattern.is_match(name) {
        return Err(CoreError::validation(format!(
            "invalid tool name '{name}': must be a lowercase identifier"
        ))
        .into());
    }
    Ok(())
}

/// Parse-validate the body and run the static safety screen.
pub fn validate_tool_body(body: &str) -> Result<()> {
    for pattern in FORBIDDEN_PATTERNS {
        if body.contains(pattern) {
            return Err(CoreError::validation(format!(
                "tool source rejected by safety screen: contains '{pattern}'"
            ))
            .into());
        }
    }

    if analyzer::has_parse_errors(body)? {
        return Err(CoreError::validation("tool source does not parse").into());
    }
    if !analyzer::has_function(body, "execute")? {
        return Err(CoreError::validation("tool source defines no `execute` function").into());
    }
    Ok(())
}

/// Strip markdown fences from a model response, keeping the first
/// fenced block when one exists.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }
    let mut in_block = false;
    let mut lines = Vec::new();
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            if in_block {
                break;
            }
            in_block = true;
            continue;
        }
        if in_block {
            lines.push(line);
        }
    }
    lines.join("\n").trim().to_string()
}

/// Wrap a validated body in the module template: the `execute` entry
/// point plus a `main` that bridges JSON over stdin/stdout.
fn wrap_in_template(name: &str, description: &str, body: &str) -> String {
    format!(
        "//! Tool: {name}\n\
         //! {description}\n\
         //!\n\
         //! Reads a JSON object from stdin, hands it to `execute`, and\n\
         //! writes the returned JSON object to stdout.\n\
         \n\
         {body}\n\
         \n\
         fn main() {{\n\
         \x20   use std::io::{{Read, Write}};\n\
         \n\
         \x20   let mut input = String::new();\n\
         \x20   if std::io::stdin().read_to_string(&mut input).is_err() {{\n\
         \x20       return;\n\
         \x20   }}\n\
         \x20   let trimmed = input.trim();\n\
         \x20   let args = if trimmed.is_empty() {{ \"{{}}\" }} else {{ trimmed }};\n\
         \x20   let output = execute(args);\n\
         \x20   let _ = std::io::stdout().write_all(output.as_bytes());\n\
         }}\n"
    )
}

fn compile_tool(source: &PathBuf, binary: &PathBuf) -> Result<()> {
    let output = Command::new("rustc")
        .arg("--edition")
        .arg("2021")
        .arg("-O")
        .arg(source)
        .arg("-o")
        .arg(binary)
        .output()
        .context("failed to invoke rustc")?;

    if !output.status.success() {
        return Err(CoreError::validation(format!(
            "generated tool does not compile: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into());
    }
    Ok(())
}

const FORGE_PROMPT: &str =
    "You are the tool forge of an autonomous agent runtime. Emit only compilable Rust code.";
