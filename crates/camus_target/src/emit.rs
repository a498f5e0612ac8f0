//! Serialization of a lowered pipeline.
//!
//! Two equivalent renderings of the same entries sit behind
//! [PipelineWriter]: the runtime `table_add` command format and a JSON
//! document for controllers, plus the multicast group file. Writers take a
//! plain byte sink; callers buffer and write files only after the whole
//! compilation has succeeded, so an abort never leaves partial output.

use std::io::{self, Write};

use serde_json::{Map, Number, Value};

use camus_core::value::QueryConst;

use crate::{P4Entry, P4Table, P4Value, TargetPipeline, STATE_FIELD};

/// Serializes a target pipeline to one output format.
pub trait PipelineWriter {
    fn write_pipeline<W: Write>(&self, sink: W, pipeline: &TargetPipeline) -> io::Result<()>;
}

/// The `table_add` command format, one line per entry:
///
/// ```text
/// table_add <table> <action> <match> ... => <args> [<priority>]
/// ```
#[derive(Default)]
pub struct CommandWriter {}

impl PipelineWriter for CommandWriter {
    fn write_pipeline<W: Write>(&self, mut sink: W, pipeline: &TargetPipeline) -> io::Result<()> {
        for table in pipeline.tables.values() {
            for entry in &table.entries {
                writeln!(sink, "{}", command_line(table, entry))?;
            }
        }
        Ok(())
    }
}

fn command_line(table: &P4Table, entry: &P4Entry) -> String {
    let mut line = format!("table_add {} {}", table.name, entry.action);
    for (field, value) in table.fields.iter().zip(&entry.values) {
        line.push(' ');
        line.push_str(&format_match(value, field.width));
    }
    line.push_str(" =>");
    for param in &entry.params {
        line.push(' ');
        line.push_str(&param.value.to_string());
    }
    if let Some(priority) = entry.priority {
        line.push(' ');
        line.push_str(&priority.to_string());
    }
    line
}

fn format_match(value: &P4Value, width: u32) -> String {
    match value {
        P4Value::Exact(v) => v.to_string(),
        P4Value::Range(lo, hi) => format!("{}->{}", format_low(*lo), format_high(*hi, width)),
        P4Value::Lpm(addr, plen) => format!("{}/{}", addr, plen),
    }
}

// Extreme endpoints print as hex sentinels: a lower bound of zero is the
// `Lt` shape, an all-ones upper bound the `Gt` shape.
fn format_low(lo: u128) -> String {
    if lo == 0 {
        "0x00".to_owned()
    } else {
        lo.to_string()
    }
}

fn format_high(hi: u128, width: u32) -> String {
    if hi == QueryConst::max_value(width) {
        format!("0x{}", "ff".repeat(((width / 8).max(1)) as usize))
    } else {
        hi.to_string()
    }
}

/// The JSON document: a top-level array of entry objects ending with
/// `null`. Names get the `Camus.` prefix; header fields the `hdr.` prefix,
/// except the synthetic state field which lives under `meta.`.
#[derive(Default)]
pub struct JsonWriter {}

impl PipelineWriter for JsonWriter {
    fn write_pipeline<W: Write>(&self, mut sink: W, pipeline: &TargetPipeline) -> io::Result<()> {
        writeln!(sink, "[")?;
        for table in pipeline.tables.values() {
            for entry in &table.entries {
                writeln!(sink, "{},", entry_object(table, entry)?)?;
            }
        }
        writeln!(sink, "null")?;
        writeln!(sink, "]")?;
        Ok(())
    }
}

fn entry_object(table: &P4Table, entry: &P4Entry) -> io::Result<Value> {
    let mut object = Map::new();
    object.insert(
        "table_name".to_owned(),
        Value::String(format!("Camus.{}", table.name)),
    );

    let mut match_fields = Map::new();
    for (field, value) in table.fields.iter().zip(&entry.values) {
        let key = if field.name == STATE_FIELD {
            format!("meta.{}", field.name)
        } else {
            format!("hdr.{}", field.name)
        };
        let array = match value {
            P4Value::Exact(v) => vec![number(*v)?],
            P4Value::Range(lo, hi) => vec![number(*lo)?, number(*hi)?],
            P4Value::Lpm(addr, plen) => vec![number(*addr)?, number(*plen as u128)?],
        };
        match_fields.insert(key, Value::Array(array));
    }
    object.insert("match_fields".to_owned(), Value::Object(match_fields));

    object.insert(
        "action_name".to_owned(),
        Value::String(format!("Camus.{}", entry.action)),
    );
    let mut params = Map::new();
    for param in &entry.params {
        params.insert(param.name.clone(), Value::from(param.value));
    }
    object.insert("action_params".to_owned(), Value::Object(params));

    if let Some(priority) = entry.priority {
        object.insert("priority".to_owned(), Value::from(priority));
    }
    Ok(Value::Object(object))
}

// Decimal rendering keeps 128-bit values exact; serde_json re-parses them
// as arbitrary-precision numbers.
fn number(v: u128) -> io::Result<Value> {
    serde_json::from_str::<Number>(&v.to_string())
        .map(Value::Number)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Multicast group file: `<mgid>: <port> <port> ...`, ascending by mgid.
pub fn write_mcast_groups<W: Write>(mut sink: W, pipeline: &TargetPipeline) -> io::Result<()> {
    for group in &pipeline.groups {
        let ports: Vec<String> = group.ports.iter().map(|p| p.to_string()).collect();
        writeln!(sink, "{}: {}", group.mgid, ports.join(" "))?;
    }
    Ok(())
}
