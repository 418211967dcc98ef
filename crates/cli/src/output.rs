//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use scheduler_lib::toggle::ToggleOutcome;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a list of items as a table or JSON array
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(&items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to serialize output: {}", e)),
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// One-line description of a toggle outcome
pub fn describe_outcome(outcome: &ToggleOutcome) -> String {
    match outcome {
        ToggleOutcome::Suspended { remembered } => {
            format!("scaled to 0 (remembered {} replicas)", remembered)
        }
        ToggleOutcome::Resumed { replicas } => format!("scaled up to {} replicas", replicas),
        ToggleOutcome::Unchanged => "already in the requested state".to_string(),
        ToggleOutcome::NothingToRestore => "no remembered replica count to restore".to_string(),
        ToggleOutcome::NotFound => "deployment not found".to_string(),
    }
}

/// Color a workload state
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "running" => state.green().to_string(),
        "suspended" => state.blue().to_string(),
        "invalid" | "error" => state.red().to_string(),
        _ => state.to_string(),
    }
}

pub fn color_bool(value: bool) -> String {
    if value {
        "yes".green().to_string()
    } else {
        "no".dimmed().to_string()
    }
}
