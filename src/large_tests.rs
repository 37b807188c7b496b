#[cfg(test)]
mod tests {
    use std::io::Write;

    use rayon::prelude::*;
    use rstest::rstest;

    use crate::{
        decoder::DecodeEngine,
        emit::{AssemblyRecorder, PcodeRecord, PcodeRecorder, VarnodeRecord},
        format::{ListingEntry, OutputFormat},
        image::MemoryImage,
        opcode::Opcode,
        parser::DocumentStorage,
        sweep::linear_sweep,
        Address, ByteSource, ByteSourceError, ConstructionError, DecodeError, PcodeSink, Varnode,
    };

    const TOY16: &str = include_str!("../specs/toy16.xml");

    const MINIMAL: &str = r#"
        <processor name="minimal" endian="big">
            <spaces default="ram">
                <space name="ram" size="2"/>
                <space name="register" size="1"/>
            </spaces>
            <registers space="register">
                <register name="A" offset="0" size="1"/>
                <register name="B" offset="1" size="1"/>
            </registers>
            <instructions>
                <instruction mnemonic="mov" length="2" mask="0xffff" match="0x0100" operands="B, A">
                    <op code="COPY" out="B" in="A"/>
                </instruction>
            </instructions>
        </processor>
    "#;

    /// Byte source that records every request it sees.
    struct Tracking {
        image: MemoryImage,
        requests: Vec<(u64, usize)>,
    }

    impl Tracking {
        fn new(bytes: &[u8]) -> Self {
            Self {
                image: MemoryImage::new(0, bytes.to_vec()),
                requests: Vec::new(),
            }
        }
    }

    impl ByteSource for Tracking {
        fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError> {
            self.requests.push((addr.offset(), buf.len()));
            self.image.load_fill(buf, addr)
        }
    }

    struct Unmapped;

    impl ByteSource for Unmapped {
        fn load_fill(&mut self, _: &mut [u8], _: &Address<'_>) -> Result<(), ByteSourceError> {
            Err(ByteSourceError::Message("unmapped".into()))
        }
    }

    /// Sink that faults on its second record.
    #[derive(Default)]
    struct FaultsOnSecond {
        seen: usize,
    }

    impl PcodeSink for FaultsOnSecond {
        fn dump(&mut self, _: &Address<'_>, _: Opcode, _: Option<&Varnode<'_>>, _: &[Varnode<'_>]) {
            self.seen += 1;
            if self.seen == 2 {
                panic!("second record rejected");
            }
        }
    }

    fn toy<S: ByteSource>(source: S) -> DecodeEngine<S> {
        let storage = DocumentStorage::from_text(TOY16).unwrap();
        DecodeEngine::new(source, &storage).unwrap()
    }

    fn toy_image(bytes: &[u8]) -> DecodeEngine<MemoryImage> {
        toy(MemoryImage::new(0, bytes.to_vec()))
    }

    fn vn(space: &str, offset: u64, size: u32) -> VarnodeRecord {
        VarnodeRecord {
            space: space.into(),
            offset,
            size,
        }
    }

    #[test]
    fn test_minimal_register_move() {
        let storage = DocumentStorage::from_text(MINIMAL).unwrap();
        let mut engine = DecodeEngine::new(MemoryImage::new(0, vec![0x01, 0x00]), &storage).unwrap();
        let mut ops = PcodeRecorder::default();

        assert_eq!(engine.decode_one(0, &mut ops).unwrap(), 2);
        assert_eq!(
            ops.records(),
            &[PcodeRecord {
                address: 0,
                opcode: Opcode::Copy,
                output: Some(vn("register", 1, 1)),
                inputs: vec![vn("register", 0, 1)],
            }]
        );
    }

    #[test]
    fn test_byte_source_failure_is_reported() {
        let mut engine = toy(Unmapped);
        let mut ops = PcodeRecorder::default();
        let mut asm = AssemblyRecorder::default();

        let err = engine.decode_one(0x40, &mut ops).unwrap_err();
        assert!(matches!(err, DecodeError::ByteSource { address: 0x40, size: 1, .. }));
        assert!(engine.disassemble_one(0x40, &mut asm).is_err());
        assert!(ops.is_empty());
        assert!(asm.is_empty());
    }

    #[rstest]
    #[case::mov(&[0x10, 0x10], 2, "mov r1, r0")]
    #[case::add(&[0x11, 0x23], 2, "add r2, r3")]
    #[case::addi(&[0x12, 0x1f], 2, "addi r1, -0x1")]
    #[case::li(&[0x21, 0x12], 2, "li r1, 0x12")]
    #[case::ld(&[0x30, 0x01], 2, "ld r0, [r1]")]
    #[case::st(&[0x31, 0x32], 2, "st [r3], r2")]
    #[case::ret(&[0x60], 1, "ret")]
    #[case::push(&[0x72], 1, "push r2")]
    #[case::halt(&[0xff], 1, "halt")]
    #[case::call(&[0x50, 0x12, 0x34], 3, "call 0x1234")]
    fn test_decode_and_disassemble_agree(#[case] bytes: &[u8], #[case] len: usize, #[case] text: &str) {
        let mut engine = toy_image(bytes);
        let mut ops = PcodeRecorder::default();
        let mut asm = AssemblyRecorder::default();

        assert_eq!(engine.decode_one(0, &mut ops).unwrap(), len);
        assert_eq!(engine.disassemble_one(0, &mut asm).unwrap(), len);
        assert!(!ops.is_empty());
        assert_eq!(asm.len(), 1);
        assert_eq!(asm.last().unwrap().to_string(), text);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let mut engine = toy_image(&[0x50, 0x12, 0x34]);
        let mut first = PcodeRecorder::default();
        let mut second = PcodeRecorder::default();

        engine.decode_one(0, &mut first).unwrap();
        engine.decode_one(0, &mut second).unwrap();
        assert_eq!(first.records(), second.records());
    }

    #[test]
    fn test_call_semantics() {
        let mut engine = toy_image(&[0x50, 0x12, 0x34]);
        let mut ops = PcodeRecorder::default();
        engine.decode_one(0, &mut ops).unwrap();

        let opcodes: Vec<_> = ops.records().iter().map(|r| r.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::IntSub, Opcode::Store, Opcode::Call]);

        // STORE takes the space id of ram, the pointer and the return address.
        let store = &ops.records()[1];
        assert_eq!(store.output, None);
        assert_eq!(
            store.inputs,
            vec![vn("const", 1, 8), vn("register", 8, 2), vn("const", 3, 2)]
        );
        assert_eq!(ops.records()[2].inputs, vec![vn("ram", 0x1234, 2)]);
    }

    #[test]
    fn test_return_uses_temporary() {
        let mut engine = toy_image(&[0x60]);
        let mut ops = PcodeRecorder::default();
        engine.decode_one(0, &mut ops).unwrap();

        let records = ops.records();
        assert_eq!(records[0].output, Some(vn("unique", 0, 2)));
        assert_eq!(records[2].opcode, Opcode::Return);
        assert_eq!(records[2].inputs, vec![vn("unique", 0, 2)]);
    }

    #[test]
    fn test_relative_branch_target() {
        let mut bytes = vec![0u8; 0x102];
        bytes[0x100] = 0x40;
        bytes[0x101] = 0xfe;
        let mut engine = toy_image(&bytes);
        let mut ops = PcodeRecorder::default();
        let mut asm = AssemblyRecorder::default();

        engine.disassemble_one(0x100, &mut asm).unwrap();
        assert_eq!(asm.last().unwrap().to_string(), "jmp 0xfe");

        engine.decode_one(0x100, &mut ops).unwrap();
        assert_eq!(ops.records()[0].opcode, Opcode::Branch);
        assert_eq!(ops.records()[0].inputs, vec![vn("ram", 0xfe, 2)]);
    }

    #[test]
    fn test_context_changes_decode() {
        let mut engine = toy_image(&[0x21, 0x12, 0x34]);
        let mut asm = AssemblyRecorder::default();

        assert_eq!(engine.disassemble_one(0, &mut asm).unwrap(), 2);
        assert_eq!(asm.last().unwrap().to_string(), "li r1, 0x12");

        engine.set_context_variable("wide", 0, 1).unwrap();
        assert_eq!(engine.disassemble_one(0, &mut asm).unwrap(), 3);
        assert_eq!(asm.last().unwrap().to_string(), "li r1, 0x1234");

        let mut ops = PcodeRecorder::default();
        assert_eq!(engine.decode_one(0, &mut ops).unwrap(), 3);
        assert_eq!(ops.records()[0].inputs, vec![vn("const", 0x1234, 2)]);
    }

    #[rstest]
    #[case::mov_missing_operand(&[0x10])]
    #[case::call_missing_target(&[0x50, 0x12])]
    #[case::empty(&[])]
    fn test_truncated_input_fails(#[case] bytes: &[u8]) {
        let mut engine = toy_image(bytes);
        let mut ops = PcodeRecorder::default();

        let err = engine.decode_one(0, &mut ops).unwrap_err();
        assert!(matches!(err, DecodeError::ByteSource { .. }));
        assert!(ops.is_empty());
    }

    #[rstest]
    #[case::one_byte(&[0x60], vec![(0, 1)])]
    #[case::two_bytes(&[0x10, 0x10, 0xff, 0xff], vec![(0, 1), (1, 1)])]
    #[case::three_bytes(&[0x50, 0x00, 0x10, 0xff], vec![(0, 1), (1, 1), (2, 1)])]
    fn test_no_over_read(#[case] bytes: &[u8], #[case] expected: Vec<(u64, usize)>) {
        let mut engine = toy(Tracking::new(bytes));
        let mut ops = PcodeRecorder::default();

        engine.decode_one(0, &mut ops).unwrap();
        assert_eq!(engine.byte_source().requests, expected);
    }

    #[test]
    fn test_sink_fault_mid_stream() {
        let mut engine = toy_image(&[0x60]);
        let mut sink = FaultsOnSecond::default();

        let err = engine.decode_one(0, &mut sink).unwrap_err();
        assert!(matches!(err, DecodeError::CallbackFault { .. }));
        // The prefix before the fault was delivered; callers must discard it.
        assert_eq!(sink.seen, 2);

        let mut ops = PcodeRecorder::default();
        assert_eq!(engine.decode_one(0, &mut ops).unwrap(), 1);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_misaligned_address() {
        let text = TOY16.replace(r#"alignment="1""#, r#"alignment="2""#);
        let storage = DocumentStorage::from_text(&text).unwrap();
        let mut engine = DecodeEngine::new(Tracking::new(&[0x10, 0x10, 0x10]), &storage).unwrap();
        let mut ops = PcodeRecorder::default();

        let err = engine.decode_one(1, &mut ops).unwrap_err();
        assert!(matches!(err, DecodeError::Misaligned { address: 1, alignment: 2 }));
        assert!(engine.byte_source().requests.is_empty());
    }

    #[test]
    fn test_construction_errors() {
        let storage = DocumentStorage::from_text("<sleigh/>").unwrap();
        assert!(matches!(
            DecodeEngine::new(Unmapped, &storage),
            Err(ConstructionError::MissingRoot(_))
        ));

        let broken = TOY16.replace(r#"table="gpr""#, r#"table="fpr""#);
        let storage = DocumentStorage::from_text(&broken).unwrap();
        assert!(matches!(
            DecodeEngine::new(Unmapped, &storage),
            Err(ConstructionError::UnknownTable(ref t)) if t == "fpr"
        ));
    }

    #[test]
    fn test_concurrent_loads() {
        let lengths: Vec<usize> = (0..16)
            .into_par_iter()
            .map(|i| {
                let storage = DocumentStorage::from_text(TOY16).unwrap();
                let mut engine = DecodeEngine::new(MemoryImage::new(i, vec![0x10, 0x10]), &storage).unwrap();
                let mut ops = PcodeRecorder::default();
                engine.decode_one(i, &mut ops).unwrap()
            })
            .collect();

        assert!(lengths.iter().all(|&len| len == 2));
    }

    #[test]
    fn test_sweep_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x10, 0x10, 0x00, 0x60]).unwrap();

        let image = MemoryImage::from_file(file.path(), 0x200).unwrap();
        let mut engine = toy(image);
        let listing = linear_sweep(&mut engine, 0x200, 16, true);

        assert_eq!(listing.entries.len(), 3);
        assert_eq!(listing.decoded_count(), 2);
        match &listing.entries[0] {
            ListingEntry::Decoded(insn) => {
                assert_eq!(insn.bytes, vec![0x10, 0x10]);
                assert_eq!(insn.assembly.to_string(), "mov r1, r0");
                assert_eq!(insn.pcode.len(), 1);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert!(matches!(listing.entries[1], ListingEntry::Failed { address: 0x202, .. }));
        assert_eq!(listing.entries[2].address(), 0x203);

        let text = OutputFormat::Text.get_formatter().format(&listing).unwrap();
        assert!(text.contains("0x00000203: ret"));
    }

    #[test]
    fn test_sweep_stops_at_end_of_code_space() {
        let mut engine = toy_image(&vec![0x60; 0x1_0004]);
        let listing = linear_sweep(&mut engine, 0xfffe, 8, false);

        let addresses: Vec<u64> = listing.entries.iter().map(|e| e.address()).collect();
        assert_eq!(addresses, vec![0xfffe, 0xffff]);
        assert_eq!(listing.decoded_count(), 2);
    }
}
