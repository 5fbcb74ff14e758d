//! # Telemetry Viewer CLI
//!
//! Command-line tool for reading the controller's telemetry streams.
//!
//! Usage:
//!   telemetry_viewer recent <kind> [--limit N]
//!   telemetry_viewer switch <dpid> [--kind K] [--limit N]
//!   telemetry_viewer events [--type T] [--limit N]
//!   telemetry_viewer stats

use clap::{Parser, Subcommand};
use fabric::telemetry::{
    EventDetails, EventRecord, EventType, RecordKind, TelemetryQuery, TelemetryRecord,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "telemetry_viewer")]
#[command(about = "Query fabric controller telemetry streams", long_about = None)]
struct Cli {
    /// Path to the telemetry directory
    #[arg(short, long, default_value = "telemetry")]
    dir: PathBuf,

    /// Print raw JSON lines instead of summaries
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the newest records of one kind
    Recent {
        /// port_stats, port_desc, flow_stats, table_stats or event
        kind: RecordKind,

        /// Maximum number of records to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show records for one switch
    Switch {
        /// Datapath id (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_dpid)]
        dpid: u64,

        /// Restrict to one record kind
        #[arg(short, long)]
        kind: Option<RecordKind>,

        /// Maximum number of records to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show discrete events
    Events {
        /// packet_in, flow_removed, port_status, switch_connected, ...
        #[arg(short = 't', long = "type")]
        event_type: Option<EventType>,

        /// Maximum number of events to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show record counts per kind and per switch
    Stats,
}

fn parse_dpid(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid datapath id '{}': {}", s, e))
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let query = TelemetryQuery::new(&cli.dir);

    match cli.command {
        Commands::Recent { kind, limit } => {
            println!("📋 Recent {} {} records:\n", limit, kind);
            print_records(&query.recent(kind, limit)?, cli.json)?;
        }

        Commands::Switch { dpid, kind, limit } => {
            println!("🔌 Records for switch {:#x}:\n", dpid);
            print_records(&query.by_switch(dpid, kind, Some(limit))?, cli.json)?;
        }

        Commands::Events { event_type, limit } => {
            match event_type {
                Some(t) => println!("📣 Recent {} events:\n", t),
                None => println!("📣 Recent events:\n"),
            }
            print_records(&query.events(event_type, Some(limit))?, cli.json)?;
        }

        Commands::Stats => {
            let stats = query.statistics()?;

            println!("📊 Telemetry Statistics\n");
            println!("Total Records:   {}", stats.total_records());
            if let (Some(first), Some(last)) = (stats.first_ts_ms, stats.last_ts_ms) {
                println!("Time Span:       {} .. {} (Unix ms)", first, last);
            }
            if stats.skipped_lines > 0 {
                println!("Skipped Lines:   {}", stats.skipped_lines);
            }

            println!("\nBy kind:");
            for kind in RecordKind::ALL {
                let count = stats.per_kind.get(&kind).copied().unwrap_or(0);
                println!("  {:<12} {}", kind.as_str(), count);
            }

            println!("\nBy switch:");
            for (dpid, count) in &stats.per_switch {
                println!("  {:<#18x} {}", dpid, count);
            }

            if !stats.per_event_type.is_empty() {
                println!("\nBy event type:");
                for (event_type, count) in &stats.per_event_type {
                    println!("  {:<20} {}", event_type, count);
                }
            }
        }
    }

    Ok(())
}

fn print_records(records: &[TelemetryRecord], json: bool) -> Result<(), String> {
    if records.is_empty() {
        println!("(no records)");
        return Ok(());
    }
    for record in records {
        if json {
            let line = serde_json::to_string(record)
                .map_err(|e| format!("Failed to serialize record: {}", e))?;
            println!("{}", line);
        } else {
            print_record_summary(record);
        }
    }
    Ok(())
}

fn print_record_summary(record: &TelemetryRecord) {
    let prefix = format!("{} | {:#x}", record.ts_ms(), record.switch_dpid());
    match record {
        TelemetryRecord::PortStats(r) => println!(
            "{} | port {} | rx {} pkts / {} bytes | tx {} pkts / {} bytes | drops {}/{} | errors {}/{}",
            prefix,
            r.port_no,
            r.rx_packets,
            r.rx_bytes,
            r.tx_packets,
            r.tx_bytes,
            r.rx_dropped,
            r.tx_dropped,
            r.rx_errors,
            r.tx_errors
        ),
        TelemetryRecord::PortDesc(r) => println!(
            "{} | port {} ({}) | {} | config {:#x} state {:#x} | {} / {} kbps",
            prefix, r.port_no, r.name, r.hw_addr, r.config, r.state, r.curr_speed, r.max_speed
        ),
        TelemetryRecord::FlowStats(r) => println!(
            "{} | table {} prio {} | {} | {} pkts / {} bytes | {}",
            prefix, r.table_id, r.priority, r.matcher, r.packet_count, r.byte_count, r.instructions
        ),
        TelemetryRecord::TableStats(r) => println!(
            "{} | table {} | active {} | lookups {} | matched {}",
            prefix, r.table_id, r.active_count, r.lookup_count, r.matched_count
        ),
        TelemetryRecord::Event(event) => print_event_summary(&prefix, event),
    }
}

fn print_event_summary(prefix: &str, event: &EventRecord) {
    match &event.details {
        EventDetails::PacketIn(p) => println!(
            "{} | packet_in | port {} | {} → {} | {} prio {} | out {}{}",
            prefix,
            p.in_port,
            p.eth_src,
            p.eth_dst,
            p.classification,
            p.priority,
            p.output,
            if p.rule_installed { " (rule installed)" } else { "" }
        ),
        EventDetails::FlowRemoved(f) => println!(
            "{} | flow_removed | {:?} | table {} prio {} | {} | {} pkts / {} bytes after {}s",
            prefix,
            f.reason,
            f.table_id,
            f.priority,
            f.matcher,
            f.packet_count,
            f.byte_count,
            f.duration_sec
        ),
        EventDetails::PortStatus(s) => println!(
            "{} | port_status | {:?} | port {} ({}) state {:#x}",
            prefix, s.reason, s.port_no, s.name, s.state
        ),
        EventDetails::ParseError {
            in_port,
            length,
            reason,
        } => println!(
            "{} | parse_error | port {} | {} bytes | {}",
            prefix, in_port, length, reason
        ),
        EventDetails::SwitchError { error_type, code } => println!(
            "{} | switch_error | type {} code {}",
            prefix, error_type, code
        ),
        EventDetails::SwitchConnected | EventDetails::SwitchDisconnected => {
            println!("{} | {}", prefix, event.event_type)
        }
    }
}
