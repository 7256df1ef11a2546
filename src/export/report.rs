use std::io::Write;

use crate::state::{HopResult, OutcomeKind, ProtocolHop, SessionResult};

/// Generate a plain-text per-hop report, one line per protocol probed
pub fn generate_report<W: Write>(session: &SessionResult, mut writer: W) -> std::io::Result<()> {
    writeln!(writer, "tracehop report for {} ({})", session.destination, session.address)?;
    writeln!(writer, "Started: {}", session.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    let protocols: Vec<String> = session.protocols.iter().map(|p| p.to_string()).collect();
    writeln!(writer, "Protocols: {}", protocols.join(", "))?;
    if session.simulated {
        writeln!(writer, "Simulated: no probes were sent")?;
    }
    writeln!(writer)?;

    // Header
    writeln!(
        writer,
        "{:>3}  {:<5} {:<40} {:>6} {:>5} {:>9} {:>9} {:>9}",
        "#", "Proto", "Host", "Loss%", "Sent", "Avg", "Min", "Max"
    )?;
    writeln!(writer, "{}", "-".repeat(96))?;

    for hop in &session.hops {
        write_hop(&mut writer, hop)?;
    }

    writeln!(writer)?;
    if session.cancelled {
        writeln!(writer, "Trace cancelled")?;
    } else if let Some(ttl) = session.destination_ttl() {
        writeln!(writer, "Destination reached at hop {}", ttl)?;
    } else if !session.simulated {
        writeln!(writer, "Destination not reached")?;
    }

    Ok(())
}

fn write_hop<W: Write>(writer: &mut W, hop: &HopResult) -> std::io::Result<()> {
    for (i, protocol) in hop.protocols.iter().enumerate() {
        let ttl = if i == 0 {
            hop.ttl.to_string()
        } else {
            String::new()
        };
        let stats = protocol.stats();
        let ms = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.1}ms", v));

        writeln!(
            writer,
            "{:>3}  {:<5} {:<40} {:>5.1}% {:>5} {:>9} {:>9} {:>9}",
            ttl,
            protocol.protocol.to_string(),
            host_column(protocol),
            stats.loss * 100.0,
            stats.sent,
            ms(stats.avg_ms),
            ms(stats.min_ms),
            ms(stats.max_ms),
        )?;
    }

    if let Some(ext) = &hop.extensions {
        for label in &ext.mpls {
            writeln!(
                writer,
                "     [MPLS: Lbl {} TC {} S {} TTL {}]",
                label.label, label.exp, label.bottom as u8, label.ttl
            )?;
        }
        for object in &ext.objects {
            writeln!(
                writer,
                "     [ext class {} type {} len {}]",
                object.class, object.c_type, object.length
            )?;
        }
    }

    Ok(())
}

fn host_column(protocol: &ProtocolHop) -> String {
    if protocol.outcomes.is_empty() {
        return "???".to_string();
    }
    if protocol
        .outcomes
        .iter()
        .all(|o| o.kind == OutcomeKind::Simulated)
    {
        return "(simulated)".to_string();
    }

    let mut hosts: Vec<String> = Vec::new();
    for ip in protocol.outcomes.iter().filter_map(|o| o.responder) {
        let ip = ip.to_string();
        if !hosts.contains(&ip) {
            hosts.push(ip);
        }
    }
    if hosts.is_empty() {
        let stars = vec!["*"; protocol.outcomes.len()];
        return stars.join(" ");
    }
    hosts.join(", ")
}
