//! Pipeline orchestration: drives detection, header parsing, disassembly
//! and analysis in sequence, emitting progress events to a sink and
//! assembling the final report
use crate::analysis;
use crate::binary::{ParsedBinary, canon_addr, human_size};
use crate::config::Config;
use crate::detect::{self, BinFormat};
use crate::disasm::{self, InstructionDecoder};
use crate::elf;
use crate::error::AnalysisError;
use crate::pe;
use crate::report::{AnalysisInfo, DisasmInfo, FileInfo, Report, SectionInfo};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info};

/// A key/value map attached to stage events
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The bytes to analyze plus the facts the transport knows about them
#[derive(Debug)]
pub struct InputSource {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

impl InputSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            bytes,
        }
    }
}

/// Pipeline stage identifiers, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Upload,
    Detect,
    Headers,
    Sections,
    Disasm,
    Refs,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Done,
    Error,
}

/// One progress event
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub id: StageId,
    pub status: StageStatus,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Metadata>,
}

impl StageEvent {
    fn running(id: StageId, label: impl Into<String>) -> Self {
        Self {
            id,
            status: StageStatus::Running,
            label: label.into(),
            result: None,
        }
    }

    fn done(id: StageId, label: impl Into<String>, result: Option<Metadata>) -> Self {
        Self {
            id,
            status: StageStatus::Done,
            label: label.into(),
            result,
        }
    }

    fn failed(id: StageId, label: impl Into<String>) -> Self {
        Self {
            id,
            status: StageStatus::Error,
            label: label.into(),
            result: None,
        }
    }
}

/// Receiver of progress events: a stage sequence followed by exactly one
/// terminal `results` or `error` call
pub trait ProgressSink {
    fn stage(&mut self, event: StageEvent);
    fn results(&mut self, report: &Report);
    fn error(&mut self, message: &str);
}

/// Sink logging stages through `tracing`; used by the CLI front-end
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn stage(&mut self, event: StageEvent) {
        info!(stage = ?event.id, status = ?event.status, "{}", event.label);
    }

    fn results(&mut self, _report: &Report) {
        info!("analysis complete");
    }

    fn error(&mut self, message: &str) {
        error!("analysis failed: {message}");
    }
}

fn meta(value: serde_json::Value) -> Option<Metadata> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

// Pass-through record for formats without a dedicated header parser
fn passthrough(format: BinFormat, len: u64) -> ParsedBinary {
    let mut info = BTreeMap::new();
    info.insert("format".to_string(), format.description().to_string());
    ParsedBinary {
        format,
        type_str: format.description().to_string(),
        arch: "unknown".to_string(),
        bits: 32,
        entry_point: None,
        sections: Vec::new(),
        info,
        summary: format!("{} ({} bytes)", format.description(), len),
        issues: Vec::new(),
    }
}

struct Stages<'a> {
    sink: &'a mut dyn ProgressSink,
    pause_ms: u64,
}

impl Stages<'_> {
    fn emit(&mut self, event: StageEvent) {
        self.sink.stage(event);
    }

    // Short cooperative pause between stages so progress stays observable
    fn breathe(&self) {
        if self.pause_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.pause_ms));
        }
    }
}

/// Run the full analysis over an input source. Emits the stage sequence to
/// the sink, then exactly one terminal `results` or `error` event, and
/// returns the assembled report. The input buffer is consumed and released
/// once the report exists.
pub fn analyze(
    input: InputSource,
    decoder: Option<&dyn InstructionDecoder>,
    config: &Config,
    sink: &mut dyn ProgressSink,
) -> Result<Report, AnalysisError> {
    let mut stages = Stages {
        sink,
        pause_ms: config.stage_pause_ms,
    };
    let InputSource { name, size, bytes } = input;
    let size_str = human_size(size);

    stages.emit(StageEvent::done(
        StageId::Upload,
        format!("received {name} ({size_str})"),
        meta(json!({ "name": name, "size": size, "size_str": size_str })),
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Detect, "detecting format"));
    let detected = detect::detect(&bytes);
    stages.emit(StageEvent::done(
        StageId::Detect,
        detected.description,
        meta(json!({ "format": detected.description })),
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Headers, "parsing headers"));
    let parsed = match detected.format {
        BinFormat::Pe => pe::parse(&bytes),
        BinFormat::Elf => elf::parse(&bytes),
        other => Ok(passthrough(other, size)),
    };
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            let message = e.to_string();
            stages.emit(StageEvent::failed(StageId::Headers, message.clone()));
            stages.sink.error(&message);
            return Err(e);
        }
    };
    stages.emit(StageEvent::done(
        StageId::Headers,
        parsed.summary.clone(),
        None,
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Sections, "reading sections"));
    stages.emit(StageEvent::done(
        StageId::Sections,
        format!("{} sections", parsed.sections.len()),
        meta(json!({ "count": parsed.sections.len() })),
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Disasm, "disassembling"));
    // Primary code section: the one holding the entry point when marked
    // executable, otherwise the first executable section with file data
    let code_sec = parsed
        .sections
        .iter()
        .filter(|s| s.is_code && s.raw_size > 0)
        .find(|s| {
            parsed.entry_point.is_some_and(|e| {
                e >= s.virtual_address && e < s.virtual_address + s.virtual_size.max(s.raw_size)
            })
        })
        .or_else(|| {
            parsed
                .sections
                .iter()
                .find(|s| s.is_code && s.raw_size > 0)
        });
    let (sec_name, base_va, code) = match code_sec {
        Some(sec) => {
            // Bound the span by the buffer regardless of header contents
            let start = sec.raw_offset.min(bytes.len() as u64) as usize;
            let end = sec
                .raw_offset
                .saturating_add(sec.raw_size)
                .min(bytes.len() as u64) as usize;
            (sec.name.clone(), sec.virtual_address, &bytes[start..end])
        }
        None => ("file".to_string(), 0, &bytes[..]),
    };
    let listing = disasm::disassemble(decoder, code, base_va, parsed.bits, config);
    let disasm_label = if listing.fallback {
        format!("hex view, {} rows (decoder unavailable)", listing.instructions.len())
    } else {
        format!("{} instructions", listing.instructions.len())
    };
    stages.emit(StageEvent::done(
        StageId::Disasm,
        disasm_label,
        meta(json!({
            "section": sec_name,
            "fallback": listing.fallback,
            "count": listing.instructions.len(),
        })),
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Refs, "indexing references"));
    let xrefs = analysis::build_xrefs(&listing.instructions, parsed.bits);
    let func_labels = analysis::detect_functions(&listing.instructions);
    let byte_sigs = analysis::scan_signatures(code, base_va, parsed.bits, config);
    stages.emit(StageEvent::done(
        StageId::Refs,
        format!(
            "{} targets, {} functions, {} signature hits",
            xrefs.len(),
            func_labels.len(),
            byte_sigs.len()
        ),
        meta(json!({
            "xrefs": xrefs.len(),
            "functions": func_labels.len(),
            "signatures": byte_sigs.len(),
        })),
    ));
    stages.breathe();

    stages.emit(StageEvent::running(StageId::Report, "assembling report"));
    let report = Report {
        sections: parsed
            .sections
            .iter()
            .map(|s| SectionInfo::from_record(s, parsed.bits))
            .collect(),
        disasm: DisasmInfo {
            section: sec_name,
            fallback: listing.fallback,
            instructions: listing.instructions,
            base_va: canon_addr(base_va, parsed.bits),
        },
        analysis: AnalysisInfo {
            xrefs,
            func_labels,
            byte_sigs,
        },
        file: FileInfo {
            name,
            size,
            size_str,
            format: detected.description.to_string(),
            type_str: parsed.type_str,
            arch: parsed.arch,
            bits: parsed.bits,
            summary: parsed.summary,
            info: parsed.info,
            issues: parsed.issues,
        },
    };
    drop(bytes);
    stages.emit(StageEvent::done(StageId::Report, "report assembled", None));

    stages.sink.results(&report);
    Ok(report)
}
