use colored::*;

use crate::core::{MessageEntry, SessionMeta};

pub fn print_header(text: &str) {
    println!("\n{}", text.bright_cyan().bold());
    println!("{}", "=".repeat(text.len()).bright_cyan());
}

pub fn print_success(text: &str) {
    println!("{}", text.green());
}

pub fn print_error(text: &str) {
    eprintln!("{}", text.red().bold());
}

pub fn print_info(text: &str) {
    println!("{}", text.blue());
}

pub fn print_warning(text: &str) {
    println!("{}", text.yellow().bold());
}

pub fn print_session(meta: &SessionMeta) {
    let status = if meta.is_fully_cached {
        "full".green()
    } else {
        "stub".yellow()
    };
    println!(
        "{:<36} {:<5} {:>5} msgs {:>10} B  {}  {}",
        meta.session_id.as_str().bold(),
        status,
        meta.message_count,
        meta.size_bytes,
        meta.last_accessed_at.format("%Y-%m-%d %H:%M:%S"),
        meta.title.as_deref().unwrap_or("").dimmed()
    );
}

pub fn print_message(message: &MessageEntry) {
    let role = match message.role.as_str() {
        "user" => message.role.bright_green(),
        "assistant" => message.role.bright_blue(),
        _ => message.role.normal(),
    };
    let streaming = if message.is_streaming() { " …" } else { "" };
    println!(
        "#{:<4} {} (rev {}){}",
        message.sequence_number,
        role.bold(),
        message.revision,
        streaming.yellow()
    );
    if !message.content.text.is_empty() {
        println!("      {}", message.content.text);
    }
    for tool in message.content.tools.keys() {
        println!("      {} {}", "tool".magenta(), tool);
    }
}
