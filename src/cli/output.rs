// Terminal output helpers for the vigil CLI

use crate::supervision::LinkState;
use colored::Colorize;

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "→".blue(), message);
}

pub fn format_link_state(state: LinkState) -> String {
    match state {
        LinkState::Alive => state.to_string().green().to_string(),
        LinkState::Starting => state.to_string().yellow().to_string(),
        LinkState::Degraded => state.to_string().yellow().bold().to_string(),
        LinkState::Lost => state.to_string().red().bold().to_string(),
    }
}

pub fn print_status(role: &str, version: &str, pid: u32, link_state: LinkState, protected: bool) {
    let protection = if protected {
        "protected".green().to_string()
    } else {
        "unprotected".yellow().to_string()
    };
    println!(
        "{} {} v{} (pid {}) | counterpart {}, {}",
        "●".green(),
        role.bold(),
        version,
        pid,
        format_link_state(link_state),
        protection
    );
}
