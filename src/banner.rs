//! Стартовый баннер брокера.

use std::{env, net::SocketAddr};

use atty::Stream;
use chrono::{DateTime, Local};
use owo_colors::OwoColorize;
use sysinfo::System;

use crate::server::VERSION;

/// Полный баннер с информацией о сервере.
pub const ASCII_FULL: &str = r#"
    Nexum {version}
    ----------------------------------------------
    Server ID:        {server_id}
    Clients:          {client}
    Cluster:          {cluster}
    Routes:           {routes}
    Auth:             {auth}
    PID:              {pid}
    Host:             {host}
    OS/Arch:          {os}/{arch}
    CPU(s):           {cpus}
    Memory:           {mem}
    Build:            {git} ({build_time})
"#;

/// Компактный баннер для вывода.
pub const ASCII_COMPACT: &str = r#"
Nexum {version} - {client} - cluster {cluster} - PID {pid}
"#;

/// Что показать в баннере о запущенном сервере.
#[derive(Debug, Clone)]
pub struct BannerInfo {
    pub server_id: String,
    pub client_addr: Option<SocketAddr>,
    pub cluster_addr: Option<SocketAddr>,
    pub routes: usize,
    pub auth_required: bool,
}

/// Подставляет значения в шаблон баннера.
pub fn render_banner(
    info: &BannerInfo,
    full: bool,
) -> String {
    let bits = std::mem::size_of::<usize>() * 8;
    let version = format!("{VERSION} ({bits}-bit)");
    let client = addr_or(info.client_addr, "not listening");
    let cluster = addr_or(info.cluster_addr, "disabled");
    let pid = std::process::id().to_string();

    if !full {
        return ASCII_COMPACT
            .replace("{version}", &version)
            .replace("{client}", &client)
            .replace("{cluster}", &cluster)
            .replace("{pid}", &pid);
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let host = System::host_name().unwrap_or_else(|| "unknown".into());

    ASCII_FULL
        .replace("{version}", &version)
        .replace("{server_id}", &info.server_id)
        .replace("{client}", &client)
        .replace("{cluster}", &cluster)
        .replace("{routes}", &info.routes.to_string())
        .replace("{auth}", if info.auth_required { "required" } else { "none" })
        .replace("{pid}", &pid)
        .replace("{host}", &host)
        .replace("{os}", env::consts::OS)
        .replace("{arch}", env::consts::ARCH)
        .replace("{cpus}", &num_cpus::get().to_string())
        .replace("{mem}", &format_memory(sys.total_memory()))
        .replace("{git}", option_env!("GIT_COMMIT").unwrap_or("unknown"))
        .replace("{build_time}", &build_time())
}

/// Печатает баннер. `NEXUM_BANNER=full|compact` переопределяет вид.
pub fn print_banner(info: &BannerInfo) {
    let full = match env::var("NEXUM_BANNER").ok().as_deref() {
        Some("full") => true,
        Some("compact") => false,
        _ => cfg!(debug_assertions),
    };
    let text = render_banner(info, full);

    if !atty::is(Stream::Stdout) {
        println!("{text}");
        return;
    }
    if !full {
        println!("{}", text.bold().green());
        return;
    }
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if i == 1 {
            println!("{}", line.bold().bright_blue());
        } else if trimmed.starts_with("Clients:") || trimmed.starts_with("Cluster:") {
            println!("{}", line.cyan());
        } else if trimmed.starts_with("Build:") {
            println!("{}", line.dimmed());
        } else {
            println!("{line}");
        }
    }
    println!();
}

/// Строка о готовности принимать соединения.
pub fn print_startup_log() {
    let pid = std::process::id();
    let ts = Local::now().format("%d %b %Y %H:%M:%S%.3f");

    if atty::is(Stream::Stdout) {
        println!(
            "[{}] {} {}",
            pid.to_string().red(),
            ts.to_string().white(),
            "* Ready to accept connections".green()
        );
    } else {
        println!("[{pid}] {ts} * Ready to accept connections");
    }
}

fn addr_or(
    addr: Option<SocketAddr>,
    fallback: &str,
) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// `sysinfo` отдаёт объём памяти в байтах.
fn format_memory(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes >= KB * KB * KB {
        format!("{:.1} GB", bytes / (KB * KB * KB))
    } else if bytes >= KB * KB {
        format!("{:.1} MB", bytes / (KB * KB))
    } else {
        format!("{:.1} KB", bytes / KB)
    }
}

fn build_time() -> String {
    let raw = option_env!("BUILD_TIME").unwrap_or("unknown");
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Local).format("%d.%m.%Y %H:%M:%S").to_string(),
        Err(_) => raw.to_string(),
    }
}
