use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tickchat_proto::{EventKind, ServerEvent, ServerFrame};

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    server: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    events: Option<&'a [ServerEvent]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Print one frame received from `server`. `raw` is the undecoded payload.
pub fn print_frame(frame: &ServerFrame, raw: &[u8], server: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = match frame {
                ServerFrame::Batch(events) => FrameOutput {
                    server,
                    kind: "batch",
                    events: Some(events),
                    error: None,
                },
                ServerFrame::Error(err) => FrameOutput {
                    server,
                    kind: "error",
                    events: None,
                    error: Some(&err.message),
                },
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => match frame {
            ServerFrame::Batch(events) => println!("{}", events_table(events)),
            ServerFrame::Error(err) => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["SERVER", "ERROR"])
                    .add_row(vec![server.to_string(), err.message.clone()]);
                println!("{table}");
            }
        },
        OutputFormat::Pretty => match frame {
            ServerFrame::Batch(events) => {
                for event in events {
                    println!("{}", pretty_line(event));
                }
            }
            ServerFrame::Error(err) => println!("! {} ({server})", err.message),
        },
        OutputFormat::Raw => print_raw(raw),
    }
}

fn events_table(events: &[ServerEvent]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["TIMESTAMP", "CHANNEL", "KIND", "USER", "EVENT"]);
    for event in events {
        table.add_row(vec![
            event.timestamp.to_string(),
            event.channel_id.to_string(),
            kind_name(event.kind).to_string(),
            event.user_name.clone(),
            event.event.clone(),
        ]);
    }
    table
}

fn pretty_line(event: &ServerEvent) -> String {
    match event.kind {
        EventKind::User => format!(
            "[{}] #{} <{}> {}",
            event.timestamp, event.channel_id, event.user_name, event.event
        ),
        EventKind::System => format!(
            "[{}] #{} * {} {}",
            event.timestamp, event.channel_id, event.user_name, event.event
        ),
    }
}

fn kind_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::User => "user",
        EventKind::System => "system",
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickchat_proto::SystemEvent;

    #[test]
    fn pretty_lines_distinguish_kinds() {
        let said = ServerEvent::user("ann", "hi", 10, 3);
        let joined = ServerEvent::system("ann", SystemEvent::Join, 9, 3);
        assert_eq!(pretty_line(&said), "[10] #3 <ann> hi");
        assert_eq!(pretty_line(&joined), "[9] #3 * ann join");
    }

    #[test]
    fn table_has_one_row_per_event() {
        let events = vec![
            ServerEvent::system("ann", SystemEvent::Join, 1, 2),
            ServerEvent::user("ann", "hello", 2, 2),
        ];
        let rendered = events_table(&events).to_string();
        assert!(rendered.contains("hello"));
        assert!(rendered.contains("system"));
    }
}
