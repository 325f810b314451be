//! HTML view of the fleet, built from the same snapshot as `/status`

use std::fmt::Write;
use std::time::Duration;

use crate::core::resource::{format_bytes, GpuStats, HostView, SystemResources};
use crate::core::{FleetStatus, InstanceRecord, InstanceState};

/// Theme colors
const BG_PRIMARY: &str = "#11111b"; // Deep charcoal
const BG_SECONDARY: &str = "#181825"; // Card background
const BORDER: &str = "#323246";
const TEXT_PRIMARY: &str = "#fafaff";
const TEXT_MUTED: &str = "#717184";
const PRIMARY_LIGHT: &str = "#a5b4fc";

/// Escape text for HTML element content and attribute values
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the full page. `refresh` drives the meta auto-refresh.
pub fn page(status: &FleetStatus, host: &HostView, refresh: Duration) -> String {
    let mut html = String::with_capacity(16 * 1024);
    let refresh_secs = refresh.as_secs().max(1);

    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{refresh_secs}">
<title>gpufleet - {count} instances</title>
<style>
body {{ background: {BG_PRIMARY}; color: {TEXT_PRIMARY}; font-family: system-ui, sans-serif; margin: 24px; }}
h2 {{ color: {PRIMARY_LIGHT}; font-size: 18px; margin: 24px 0 12px; }}
table {{ border-collapse: collapse; width: 100%; background: {BG_SECONDARY}; }}
th, td {{ border-bottom: 1px solid {BORDER}; padding: 6px 10px; text-align: left; font-size: 13px; }}
th {{ color: {TEXT_MUTED}; font-weight: 600; }}
.badge {{ border-radius: 10px; padding: 2px 10px; font-size: 12px; font-weight: 600; }}
.cards {{ display: flex; gap: 12px; flex-wrap: wrap; }}
.card {{ background: {BG_SECONDARY}; border: 1px solid {BORDER}; border-radius: 8px; padding: 10px 16px; }}
.muted {{ color: {TEXT_MUTED}; }}
.err {{ color: #fb7185; }}
</style>
</head>
<body>
<h1>GPU fleet</h1>
<p class="muted">Run started {started} &middot; logs in <code>{root}</code> &middot; snapshot {generated}</p>
<p class="muted">Run logs: <a href="/api/logs/supervisor">supervisor</a> <a href="/api/logs/gpu">gpu</a> <a href="/api/logs/ports">ports</a> <a href="/api/logs/system">system</a> &middot; live feed at <code>/stream</code></p>
"#,
        count = status.instances.len(),
        started = status.session.created_at.format("%Y-%m-%d %H:%M:%S"),
        root = escape(&status.session.root_dir.display().to_string()),
        generated = status.generated_at.format("%H:%M:%S UTC"),
    );

    render_summary(&mut html, status);
    render_system(&mut html, &host.system);
    render_gpus(&mut html, &host.gpus);
    render_instances(&mut html, status, host);

    html.push_str("</body>\n</html>\n");
    html
}

fn section_header(html: &mut String, title: &str) {
    let _ = writeln!(html, "<h2>{}</h2>", escape(title));
}

fn badge(state: InstanceState) -> String {
    format!(
        r#"<span class="badge" style="background:{color}26;color:{color};border:1px solid {color}4d">{label}</span>"#,
        color = state.color(),
        label = state.label()
    )
}

fn render_summary(html: &mut String, status: &FleetStatus) {
    section_header(html, "Summary");
    html.push_str("<div class=\"cards\">\n");
    let _ = writeln!(
        html,
        "<div class=\"card\">Total <b>{}</b></div>",
        status.summary.total
    );
    for state in InstanceState::all() {
        let count = status.summary.count(*state);
        if count > 0 {
            let _ = writeln!(html, "<div class=\"card\">{} <b>{}</b></div>", badge(*state), count);
        }
    }
    let _ = writeln!(
        html,
        "<div class=\"card\">Restarts <b>{}</b></div>",
        status.summary.total_restarts
    );
    html.push_str("</div>\n");

    if !status.summary.dead.is_empty() {
        let _ = writeln!(
            html,
            "<p class=\"err\">Needs attention: instances {:?} exhausted their restart budget</p>",
            status.summary.dead
        );
    }
}

fn render_system(html: &mut String, system: &SystemResources) {
    section_header(html, "Host");
    let _ = writeln!(
        html,
        "<div class=\"cards\">\
         <div class=\"card\">CPU <b>{:.1}%</b> <span class=\"muted\">{} cores</span></div>\
         <div class=\"card\">Load <b>{:.2} {:.2} {:.2}</b></div>\
         <div class=\"card\">Memory <b>{:.1}%</b> <span class=\"muted\">{} / {}</span></div>\
         </div>",
        system.cpu_percent,
        system.cpu_cores,
        system.load_average[0],
        system.load_average[1],
        system.load_average[2],
        system.memory_percent(),
        system.used_memory_string(),
        system.total_memory_string(),
    );
}

fn render_gpus(html: &mut String, gpus: &[GpuStats]) {
    section_header(html, "GPUs");
    if gpus.is_empty() {
        html.push_str("<p class=\"muted\">No GPU counters available</p>\n");
        return;
    }
    html.push_str("<table>\n<tr><th>GPU</th><th>Name</th><th>Util</th><th>Memory</th><th>Temp</th></tr>\n");
    for gpu in gpus {
        let util = gpu
            .utilization_percent
            .map(|u| format!("{:.0}%", u))
            .unwrap_or_else(|| "-".into());
        let memory = match (gpu.memory_used_mb, gpu.memory_total_mb) {
            (Some(used), Some(total)) => format!(
                "{} / {} MiB ({:.0}%)",
                used,
                total,
                gpu.memory_percent().unwrap_or(0.0)
            ),
            _ => "-".into(),
        };
        let temp = gpu
            .temperature_c
            .map(|t| format!("{:.0} &deg;C", t))
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            gpu.index,
            escape(&gpu.name),
            util,
            memory,
            temp
        );
    }
    html.push_str("</table>\n");
}

fn render_instances(html: &mut String, status: &FleetStatus, host: &HostView) {
    section_header(html, "Instances");
    html.push_str(
        "<table>\n<tr><th>#</th><th>State</th><th>GPU / slot</th><th>Port</th><th>PID</th>\
         <th>Uptime</th><th>Restarts</th><th>Last exit</th><th>CPU</th><th>Memory</th>\
         <th>Log</th><th>Error</th></tr>\n",
    );
    for record in &status.instances {
        render_instance_row(html, record, host);
    }
    html.push_str("</table>\n");
}

fn render_instance_row(html: &mut String, record: &InstanceRecord, host: &HostView) {
    let health = host.instance(record.ordinal);
    let port = match health {
        Some(h) if h.listening => format!("{} &#x2714;", record.port),
        _ => record.port.to_string(),
    };
    let usage = health.and_then(|h| h.usage.as_ref());
    let dash = || "-".to_string();

    let mut errors = Vec::new();
    if let Some(e) = &record.last_error {
        errors.push(escape(e));
    }
    if let Some(e) = &record.logging_error {
        errors.push(escape(e));
    }
    if record.forced_kill {
        errors.push("force-killed".into());
    }

    let _ = writeln!(
        html,
        "<tr><td>{ordinal}</td><td>{badge}</td><td>{slot}</td><td>{port}</td><td>{pid}</td>\
         <td>{uptime}</td><td>{restarts}</td><td>{exit}</td><td>{cpu}</td><td>{mem}</td>\
         <td>{log}</td><td class=\"err\">{errors}</td></tr>",
        ordinal = record.ordinal,
        badge = badge(record.state),
        slot = record.assignment,
        port = port,
        pid = record.pid.map(|p| p.to_string()).unwrap_or_else(dash),
        uptime = record.uptime_string(),
        restarts = record.restart_count,
        exit = record.last_exit.map(|e| e.to_string()).unwrap_or_else(dash),
        cpu = usage.map(|u| u.cpu_string()).unwrap_or_else(dash),
        mem = usage.map(|u| format_bytes(u.memory_bytes)).unwrap_or_else(dash),
        log = match &record.log_path {
            Some(_) => format!("<a href=\"/api/logs/{}\">tail</a>", record.ordinal),
            None => dash(),
        },
        errors = errors.join("<br>"),
    );
}
