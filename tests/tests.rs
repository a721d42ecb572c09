use disasm_rs::cfg::{EdgeKind, build_cfg};
use disasm_rs::config::Config;
use disasm_rs::disasm::{DecoderUnavailable, InstructionDecoder, RawInst};
use disasm_rs::interp::Interpreter;
use disasm_rs::pipeline::{InputSource, ProgressSink, StageEvent, StageId, StageStatus, analyze};
use disasm_rs::report::Report;

#[derive(Default)]
struct CollectSink {
    events: Vec<StageEvent>,
    results: usize,
    errors: Vec<String>,
}

impl ProgressSink for CollectSink {
    fn stage(&mut self, event: StageEvent) {
        self.events.push(event);
    }

    fn results(&mut self, _report: &Report) {
        self.results += 1;
    }

    fn error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

struct Scripted(Vec<RawInst>);

impl InstructionDecoder for Scripted {
    fn decode(&self, _: &[u8], _: u64, _: u32) -> Result<Vec<RawInst>, DecoderUnavailable> {
        Ok(self.0.clone())
    }
}

fn raw(ip: u64, bytes: &[u8], text: &str) -> RawInst {
    RawInst {
        ip,
        bytes: bytes.to_vec(),
        text: text.to_string(),
    }
}

fn quiet_config() -> Config {
    Config {
        stage_pause_ms: 0,
        ..Config::default()
    }
}

/// Minimal PE32+ image: DOS header, COFF header (AMD64, one section,
/// executable), optional header and a `.text` section backed by 16 bytes
/// of code at file offset 0x200
fn minimal_pe64() -> Vec<u8> {
    let mut b = vec![0u8; 0x40];
    b[0] = b'M';
    b[1] = b'Z';
    b[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
    b.extend_from_slice(b"PE\x00\x00");
    b.extend_from_slice(&0x8664u16.to_le_bytes()); // machine
    b.extend_from_slice(&1u16.to_le_bytes()); // section count
    b.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0x70u16.to_le_bytes()); // optional header size
    b.extend_from_slice(&0x0002u16.to_le_bytes()); // characteristics

    let mut opt = vec![0u8; 0x70];
    opt[0..2].copy_from_slice(&0x20Bu16.to_le_bytes()); // PE32+
    opt[16..20].copy_from_slice(&0x1000u32.to_le_bytes()); // entry point
    opt[20..24].copy_from_slice(&0x1000u32.to_le_bytes()); // base of code
    opt[24..32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes()); // image base
    opt[68..70].copy_from_slice(&3u16.to_le_bytes()); // subsystem
    b.extend_from_slice(&opt);

    let mut sec = [0u8; 40];
    sec[0..5].copy_from_slice(b".text");
    sec[8..12].copy_from_slice(&0x10u32.to_le_bytes()); // virtual size
    sec[12..16].copy_from_slice(&0x1000u32.to_le_bytes()); // virtual address
    sec[16..20].copy_from_slice(&0x10u32.to_le_bytes()); // raw size
    sec[20..24].copy_from_slice(&0x200u32.to_le_bytes()); // raw offset
    sec[36..40].copy_from_slice(&0x6000_0020u32.to_le_bytes()); // flags
    b.extend_from_slice(&sec);

    b.resize(0x200, 0);
    b.extend_from_slice(&[
        0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0x83, 0xc0, 0x03, // add eax, 3
        0xc3, // ret
        0xcc, // int3 padding
        0xf3, 0xaa, // rep stosb
        0x90, 0x90, 0x90, 0x90,
    ]);
    b
}

/// Minimal ELF64-LE image: header, two section headers (`.text` and the
/// name string table) and 0x20 bytes of code at file offset 0x1000
fn minimal_elf64() -> Vec<u8> {
    let mut b = vec![0u8; 64];
    b[0..4].copy_from_slice(b"\x7fELF");
    b[4] = 2; // 64-bit
    b[5] = 1; // little-endian
    b[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    b[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // AMD64
    b[24..32].copy_from_slice(&0x401000u64.to_le_bytes()); // entry
    b[40..48].copy_from_slice(&64u64.to_le_bytes()); // section header offset
    b[58..60].copy_from_slice(&64u16.to_le_bytes()); // shentsize
    b[60..62].copy_from_slice(&2u16.to_le_bytes()); // shnum
    b[62..64].copy_from_slice(&1u16.to_le_bytes()); // shstrndx

    let mut text = [0u8; 64];
    text[0..4].copy_from_slice(&1u32.to_le_bytes()); // name offset
    text[4..8].copy_from_slice(&1u32.to_le_bytes()); // PROGBITS
    text[8..16].copy_from_slice(&0x6u64.to_le_bytes()); // ALLOC|EXEC
    text[16..24].copy_from_slice(&0x401000u64.to_le_bytes()); // address
    text[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // file offset
    text[32..40].copy_from_slice(&0x20u64.to_le_bytes()); // size
    b.extend_from_slice(&text);

    let strtab_data: &[u8] = b"\x00.text\x00";
    let mut strtab = [0u8; 64];
    strtab[0..4].copy_from_slice(&0u32.to_le_bytes());
    strtab[4..8].copy_from_slice(&3u32.to_le_bytes()); // STRTAB
    strtab[24..32].copy_from_slice(&192u64.to_le_bytes()); // file offset
    strtab[32..40].copy_from_slice(&(strtab_data.len() as u64).to_le_bytes());
    b.extend_from_slice(&strtab);
    b.extend_from_slice(strtab_data);

    b.resize(0x1000, 0);
    let mut code = vec![
        0xf3, 0xaa, // rep stosb
        0x90, // nop
        0xf3, 0xab, // rep stosd
        0xc3, // ret
    ];
    code.resize(0x20, 0xcc);
    b.extend_from_slice(&code);
    b
}

#[test]
fn parse_pe64() {
    let bytes = minimal_pe64();
    let parsed = disasm_rs::pe::parse(&bytes).unwrap_or_else(|e| panic!("Can't parse PE: {e}"));
    assert_eq!(parsed.arch, "AMD64", "arch mismatch");
    assert_eq!(parsed.bits, 64, "bits mismatch");
    assert_eq!(parsed.type_str, "EXE", "file type mismatch");
    assert_eq!(parsed.entry_point, Some(0x1000), "entry point mismatch");
    assert_eq!(parsed.sections.len(), 1, "section count mismatch");
    let sec = &parsed.sections[0];
    assert_eq!(sec.name, ".text", "section name mismatch");
    assert!(sec.is_code, "is_code mismatch");
    assert_eq!(sec.flags_str, "CODE|EXEC|READ", "flags_str mismatch");
    assert_eq!(sec.virtual_address, 0x1000, "virtual address mismatch");
    assert_eq!(sec.raw_offset, 0x200, "raw offset mismatch");
    assert_eq!(sec.raw_size, 0x10, "raw size mismatch");
    assert_eq!(
        parsed.info.get("timestamp").map(String::as_str),
        Some("1970-01-01 00:00:00 UTC"),
        "timestamp mismatch"
    );
    assert_eq!(
        parsed.info.get("subsystem").map(String::as_str),
        Some("Windows console"),
        "subsystem mismatch"
    );
    assert!(parsed.issues.is_empty(), "unexpected issues: {:?}", parsed.issues);
}

#[test]
fn parse_elf64() {
    let bytes = minimal_elf64();
    let parsed = disasm_rs::elf::parse(&bytes).unwrap_or_else(|e| panic!("Can't parse ELF: {e}"));
    assert_eq!(parsed.arch, "AMD64", "arch mismatch");
    assert_eq!(parsed.bits, 64, "bits mismatch");
    assert_eq!(parsed.type_str, "Executable", "type mismatch");
    assert_eq!(parsed.entry_point, Some(0x401000), "entry point mismatch");
    assert_eq!(parsed.sections.len(), 2, "section count mismatch");
    let sec = &parsed.sections[0];
    assert_eq!(sec.name, ".text", "section name mismatch");
    assert!(sec.is_code, "is_code mismatch");
    assert_eq!(sec.flags_str, "ALLOC|EXEC", "flags_str mismatch");
    assert_eq!(sec.virtual_address, 0x401000, "address mismatch");
    assert_eq!(sec.type_str, "PROGBITS", "section type mismatch");
    assert!(!parsed.sections[1].is_code, "strtab marked as code");
}

// Big-endian ELF64 header fields must come from native big-endian reads
#[test]
fn parse_elf64_big_endian() {
    let mut b = vec![0u8; 64];
    b[0..4].copy_from_slice(b"\x7fELF");
    b[4] = 2;
    b[5] = 2; // big-endian
    b[16..18].copy_from_slice(&2u16.to_be_bytes());
    b[18..20].copy_from_slice(&0x16u16.to_be_bytes()); // S390
    b[24..32].copy_from_slice(&0x0000_0001_8000_2000u64.to_be_bytes());
    let parsed = disasm_rs::elf::parse(&b).unwrap_or_else(|e| panic!("Can't parse ELF: {e}"));
    assert_eq!(parsed.arch, "S390", "arch mismatch");
    assert_eq!(
        parsed.entry_point,
        Some(0x0000_0001_8000_2000),
        "entry point mismatch"
    );
    assert_eq!(
        parsed.info.get("endianness").map(String::as_str),
        Some("big-endian"),
        "endianness mismatch"
    );
}

// The subsystem field is read at optional-header offset 68 regardless of
// the PE32/PE32+ shape
#[test]
fn pe32_subsystem_read() {
    let mut bytes = minimal_pe64();
    let opt_base = 0x40 + 24;
    bytes[opt_base..opt_base + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
    bytes[opt_base + 68..opt_base + 70].copy_from_slice(&2u16.to_le_bytes());
    let parsed = disasm_rs::pe::parse(&bytes).unwrap_or_else(|e| panic!("Can't parse PE: {e}"));
    assert_eq!(parsed.bits, 32, "bits mismatch");
    assert_eq!(
        parsed.info.get("subsystem").map(String::as_str),
        Some("Windows GUI"),
        "subsystem mismatch"
    );
}

#[test]
fn truncated_pe_rejected() {
    assert!(disasm_rs::pe::parse(b"MZ").is_err());
    let mut bytes = vec![0u8; 0x40];
    bytes[0] = b'M';
    bytes[1] = b'Z';
    bytes[0x3c..0x40].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
    assert!(disasm_rs::pe::parse(&bytes).is_err(), "bad e_lfanew accepted");
}

#[test]
fn pipeline_pe_with_decoder() {
    let config = quiet_config();
    let decoder = Scripted(vec![
        raw(0x1000, &[0xb8, 0x05, 0x00, 0x00, 0x00], "mov eax, 5"),
        raw(0x1005, &[0x83, 0xc0, 0x03], "add eax, 3"),
        raw(0x1008, &[0xe8, 0xf3, 0xff, 0xff, 0xff], "call 1000h"),
        raw(0x100d, &[0xc3], "ret"),
    ]);
    let mut sink = CollectSink::default();
    let input = InputSource::new("demo.exe", minimal_pe64());
    let report = analyze(input, Some(&decoder), &config, &mut sink)
        .unwrap_or_else(|e| panic!("pipeline failed: {e}"));

    assert_eq!(report.file.format, "PE (Windows executable)", "format mismatch");
    assert_eq!(report.file.type_str, "EXE", "type mismatch");
    assert_eq!(report.file.bits, 64, "bits mismatch");
    assert_eq!(report.file.size_str, "528 B", "size_str mismatch");
    assert_eq!(report.sections.len(), 1, "section count mismatch");
    assert_eq!(
        report.sections[0].virtual_address, "0x0000000000001000",
        "virtual address mismatch"
    );

    assert_eq!(report.disasm.section, ".text", "disasm section mismatch");
    assert!(!report.disasm.fallback, "fallback unexpectedly set");
    assert_eq!(report.disasm.base_va, "0x0000000000001000", "base_va mismatch");
    assert_eq!(report.disasm.instructions.len(), 4, "instruction count mismatch");
    assert_eq!(report.disasm.instructions[0].mnemonic, "mov");
    assert_eq!(report.disasm.instructions[0].operands, "eax, 5");

    // call 1000h resolves to a 64-bit canonical key
    let callers = &report.analysis.xrefs["0x0000000000001000"];
    assert_eq!(callers.len(), 1, "xref count mismatch");
    assert_eq!(callers[0].from, "0x0000000000001008", "xref source mismatch");
    assert_eq!(
        report.analysis.func_labels["0x0000000000001000"], "sub_1000",
        "function label mismatch"
    );
    // rep stosb planted at file offset 0x20a, virtual 0x100a
    assert_eq!(report.analysis.byte_sigs.len(), 1, "signature count mismatch");
    assert_eq!(report.analysis.byte_sigs[0].address, "0x000000000000100a");
    assert_eq!(report.analysis.byte_sigs[0].name, "rep stosb");

    // stage sequence: every stage done, one terminal results event
    assert_eq!(sink.results, 1, "results event count mismatch");
    assert!(sink.errors.is_empty(), "unexpected errors: {:?}", sink.errors);
    let done: Vec<StageId> = sink
        .events
        .iter()
        .filter(|e| e.status == StageStatus::Done)
        .map(|e| e.id)
        .collect();
    assert_eq!(
        done,
        vec![
            StageId::Upload,
            StageId::Detect,
            StageId::Headers,
            StageId::Sections,
            StageId::Disasm,
            StageId::Refs,
            StageId::Report,
        ],
        "stage order mismatch"
    );
}

#[test]
fn pipeline_elf_fallback() {
    let config = quiet_config();
    let mut sink = CollectSink::default();
    let input = InputSource::new("demo.elf", minimal_elf64());
    let report = analyze(input, None, &config, &mut sink)
        .unwrap_or_else(|e| panic!("pipeline failed: {e}"));

    assert_eq!(report.file.format, "ELF", "format mismatch");
    assert_eq!(report.file.arch, "AMD64", "arch mismatch");
    assert!(report.disasm.fallback, "fallback flag not set");
    assert_eq!(report.disasm.section, ".text", "disasm section mismatch");
    // 0x20 code bytes frame into two 16-byte rows
    assert_eq!(report.disasm.instructions.len(), 2, "row count mismatch");
    assert_eq!(
        report.disasm.instructions[0].address, "0x00401000",
        "row address mismatch"
    );
    assert!(report.disasm.instructions[0].operands.is_empty());

    let sigs = &report.analysis.byte_sigs;
    assert_eq!(sigs.len(), 2, "signature count mismatch");
    assert_eq!(sigs[0].name, "rep stosb");
    assert_eq!(sigs[0].address, "0x0000000000401000");
    assert_eq!(sigs[1].name, "rep stosd");
    assert_eq!(sigs[1].address, "0x0000000000401003");
    assert_eq!(sink.results, 1, "results event count mismatch");
}

#[test]
fn pipeline_raw_buffer() {
    let config = quiet_config();
    let mut sink = CollectSink::default();
    let input = InputSource::new("notes.txt", b"just some text, nothing more".to_vec());
    let report = analyze(input, None, &config, &mut sink)
        .unwrap_or_else(|e| panic!("pipeline failed: {e}"));
    assert_eq!(report.file.format, "Raw data", "format mismatch");
    assert!(report.sections.is_empty(), "unexpected sections");
    assert_eq!(report.disasm.section, "file", "disasm section mismatch");
    assert!(report.disasm.fallback, "fallback flag not set");
    assert_eq!(report.disasm.base_va, "0x00000000", "base_va mismatch");
}

#[test]
fn pipeline_error_event() {
    let config = quiet_config();
    let mut sink = CollectSink::default();
    let mut bytes = vec![0u8; 0x40];
    bytes[0] = b'M';
    bytes[1] = b'Z';
    bytes[0x3c..0x40].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
    let result = analyze(InputSource::new("broken.exe", bytes), None, &config, &mut sink);
    assert!(result.is_err(), "broken PE accepted");
    assert_eq!(sink.results, 0, "results emitted after failure");
    assert_eq!(sink.errors.len(), 1, "error event count mismatch");
    let last = sink.events.last().expect("no stage events");
    assert_eq!(last.id, StageId::Headers, "failing stage mismatch");
    assert_eq!(last.status, StageStatus::Error, "failing status mismatch");
}

#[test]
fn report_json_shape() {
    let config = quiet_config();
    let mut sink = CollectSink::default();
    let report = analyze(
        InputSource::new("demo.elf", minimal_elf64()),
        None,
        &config,
        &mut sink,
    )
    .unwrap_or_else(|e| panic!("pipeline failed: {e}"));
    let value = serde_json::to_value(&report).expect("report not serializable");
    assert_eq!(value["file"]["name"], "demo.elf");
    assert_eq!(value["file"]["type"], "Executable");
    assert_eq!(value["file"]["machine"], "AMD64");
    assert_eq!(value["sections"][0]["virtual_address"], "0x0000000000401000");
    assert_eq!(value["sections"][0]["is_code"], true);
    assert_eq!(value["disasm"]["fallback"], true);
    assert!(value["analysis"]["byte_sigs"][0]["address"].is_string());
}

#[test]
fn cfg_from_report_listing() {
    let config = quiet_config();
    let decoder = Scripted(vec![
        raw(0x00, &[0x90], "nop"),
        raw(0x05, &[0x75, 0x09], "jne 0x10"),
        raw(0x08, &[0x90], "nop"),
        raw(0x10, &[0xc3], "ret"),
    ]);
    let mut sink = CollectSink::default();
    let report = analyze(
        InputSource::new("demo.exe", minimal_pe64()),
        Some(&decoder),
        &config,
        &mut sink,
    )
    .unwrap_or_else(|e| panic!("pipeline failed: {e}"));
    let blocks = build_cfg(&report.disasm.instructions);
    assert_eq!(blocks.len(), 3, "block count mismatch");
    assert_eq!(blocks[0].succs.len(), 2, "successor count mismatch");
    assert_eq!(blocks[0].succs[0].to, 0x08);
    assert_eq!(blocks[0].succs[0].kind, EdgeKind::Fall);
    assert_eq!(blocks[0].succs[1].to, 0x10);
    assert_eq!(blocks[0].succs[1].kind, EdgeKind::Jump);
}

#[test]
fn interpreter_from_report() {
    let config = quiet_config();
    let decoder = Scripted(vec![
        raw(0x1000, &[0xb8, 0x05, 0x00, 0x00, 0x00], "mov eax, 5"),
        raw(0x1005, &[0x83, 0xc0, 0x03], "add eax, 3"),
        raw(0x1008, &[0xc3], "ret"),
    ]);
    let mut sink = CollectSink::default();
    let report = analyze(
        InputSource::new("demo.exe", minimal_pe64()),
        Some(&decoder),
        &config,
        &mut sink,
    )
    .unwrap_or_else(|e| panic!("pipeline failed: {e}"));

    let mut interp = Interpreter::from_report(&report);
    let rsp0 = interp.reg("rsp").expect("no rsp");
    interp.write_mem(rsp0, &0xdeadu64.to_le_bytes());
    for i in 0..3 {
        assert!(interp.step().is_ok(), "step {i} trapped");
    }
    assert_eq!(interp.reg("eax"), Some(8), "eax mismatch");
    assert_eq!(interp.reg("rip"), Some(0xdead), "rip mismatch");
    assert_eq!(interp.reg("rsp"), Some(rsp0 + 8), "rsp mismatch");
}

#[test]
fn analyze_from_disk() {
    let config = quiet_config();
    let dir = tempfile::tempdir().expect("no tempdir");
    let path = dir.path().join("sample.elf");
    std::fs::write(&path, minimal_elf64()).expect("can't write fixture");
    let bytes = std::fs::read(&path).expect("can't read fixture");
    let mut sink = CollectSink::default();
    let report = analyze(
        InputSource::new("sample.elf", bytes),
        None,
        &config,
        &mut sink,
    )
    .unwrap_or_else(|e| panic!("pipeline failed: {e}"));
    assert_eq!(report.file.name, "sample.elf", "name mismatch");
    assert_eq!(report.file.size, 0x1020, "size mismatch");
    assert_eq!(report.file.size_str, "4.0 KiB", "size_str mismatch");
}
