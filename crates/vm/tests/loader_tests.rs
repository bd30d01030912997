//! Bytecode container tests: phrase loading, the boot marker, probe
//! behavior for negative sizes, dumping, and the embedded boot image.

mod common;

use std::io::Write;

use common::{gref, run};
use skein_vm::{
    boot_from_image, dump_code, load_boot_file, load_bytecode, CodeBuilder, Engine, OpCode, Value,
    VmError, BYTECODE_MARKER,
};

/// Frames a `(code, constants)` pair as one container phrase.
fn phrase(words: &[u16], constants_text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(constants_text.as_bytes());
    out.push(b'\n');
    dump_code(&mut out, words).unwrap();
    out
}

/// A phrase defining `name` to the fixnum `value`.
fn define_phrase(name: &str, value: i16) -> Vec<u8> {
    let mut b = CodeBuilder::new();
    let k = b.constant(Value::symbol(name));
    b.emit1(OpCode::SMALL_INT, value as u16);
    b.emit1(OpCode::DEFINE_SYMBOL, k);
    let (chunk, _constants) = b.finish();
    phrase(&chunk.to_words(), &format!("#({name})"))
}

#[test]
fn phrases_execute_in_order_against_the_current_module() {
    let mut engine = Engine::default();

    let mut container = define_phrase("alpha", 30);
    // Second phrase reads the global defined by the first.
    let mut b = CodeBuilder::new();
    let alpha = b.constant(Value::symbol("alpha"));
    let beta = b.constant(Value::symbol("beta"));
    b.emit1(OpCode::GLOBAL_REF, alpha);
    b.emit(OpCode::PUSH);
    b.emit1(OpCode::SMALL_INT, 12);
    b.emit(OpCode::IN_ADD2);
    b.emit1(OpCode::DEFINE_SYMBOL, beta);
    let (chunk, _constants) = b.finish();
    container.extend_from_slice(&phrase(&chunk.to_words(), "#(alpha beta)"));

    assert!(load_bytecode(&mut engine, &container).unwrap());

    let v = run(&mut engine, |b| gref(b, "beta")).unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 42);
}

#[test]
fn instruction_bytes_are_big_endian_pairs() {
    let mut out = Vec::new();
    dump_code(&mut out, &[0x1234]).unwrap();
    assert_eq!(out, b"1\n\x12\x34\n");
}

#[test]
fn dump_and_reload_are_bit_equal() {
    // A chunk exercising every operand shape, including values with a
    // high byte set.
    let mut b = CodeBuilder::new();
    let k = b.constant(Value::Fixnum(999));
    b.emit1(OpCode::CONSTANT_PUSH, k);
    b.emit1(OpCode::SMALL_INT, (-2i16) as u16);
    b.emit(OpCode::IN_ADD2);
    b.emit1(OpCode::DEEP_LOCAL_REF, 0x0102);
    let (chunk, _constants) = b.finish();
    let words = chunk.to_words();

    let container = phrase(&words, "#(999)");
    // Reparse the phrase by hand: constants, size, separator, bytes.
    let mut reader = skein_vm::Reader::new(&container);
    reader.read_datum().unwrap();
    let size = reader.read_datum().unwrap().as_fixnum().unwrap() as usize;
    reader.read_raw_byte().unwrap();
    let bytes = reader.read_raw_bytes(2 * size).unwrap();
    let reloaded: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
        .collect();
    assert_eq!(reloaded, words);
}

#[test]
fn negative_size_probes_quietly_before_boot() {
    let mut engine = Engine::default();
    let container = b"#()\n-1\n".to_vec();
    assert!(!load_bytecode(&mut engine, &container).unwrap());
}

#[test]
fn negative_size_is_fatal_after_boot() {
    let mut engine = Engine::default();
    boot_from_image(&mut engine, "#()", &[OpCode::IM_VOID as u16, OpCode::END_OF_CODE as u16])
        .unwrap();
    assert!(engine.is_booted());

    let container = b"#()\n-1\n".to_vec();
    let err = load_bytecode(&mut engine, &container).unwrap_err();
    assert!(matches!(err, VmError::BadBytecode { .. }));
}

#[test]
fn boot_file_requires_the_marker_symbol() {
    let dir = std::env::temp_dir();

    let bogus = dir.join("skein-vm-test-bogus.boot");
    std::fs::write(&bogus, b"elephant 1\n").unwrap();
    let mut engine = Engine::default();
    let err = load_boot_file(&mut engine, &bogus).unwrap_err();
    assert!(matches!(err, VmError::BadBytecode { .. }));
    assert!(!engine.is_booted());

    let good = dir.join("skein-vm-test-good.boot");
    let mut file = std::fs::File::create(&good).unwrap();
    write!(file, "{BYTECODE_MARKER} 3\n").unwrap();
    file.write_all(&define_phrase("booted-flag", 9)).unwrap();
    drop(file);

    load_boot_file(&mut engine, &good).unwrap();
    assert!(engine.is_booted());
    let v = run(&mut engine, |b| gref(b, "booted-flag")).unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 9);

    let _ = std::fs::remove_file(bogus);
    let _ = std::fs::remove_file(good);
}

#[test]
fn boot_from_image_parses_constants_through_the_reader() {
    let mut engine = Engine::default();

    let mut b = CodeBuilder::new();
    b.emit1(OpCode::CONSTANT, 0);
    b.emit1(OpCode::DEFINE_SYMBOL, 1);
    let (chunk, _constants) = b.finish();

    boot_from_image(&mut engine, "#((1 2 3) image-data)", &chunk.to_words()).unwrap();
    assert!(engine.is_booted());

    let v = run(&mut engine, |b| gref(b, "image-data")).unwrap();
    assert_eq!(v.list_length(), Some(3));
}

#[test]
fn truncated_phrase_is_bad_bytecode() {
    let mut engine = Engine::default();
    // Claims 4 instruction words but carries only 2 bytes.
    let container = b"#()\n4\n\x00\x01".to_vec();
    let err = load_bytecode(&mut engine, &container).unwrap_err();
    assert!(matches!(err, VmError::BadBytecode { .. }));
}

#[test]
fn dump_code_primitive_writes_a_loadable_phrase_tail() {
    let mut engine = Engine::default();
    let path = std::env::temp_dir().join("skein-vm-test-dump.bin");
    let path_text = path.to_string_lossy().into_owned();

    // (%dump-code "<path>" #(<IM_ONE> <END_OF_CODE>))
    run(&mut engine, |b| {
        let file = b.constant(Value::string(path_text.clone()));
        let code = b.constant(Value::vector(vec![
            Value::Fixnum(OpCode::IM_ONE as i64),
            Value::Fixnum(OpCode::END_OF_CODE as i64),
        ]));
        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::CONSTANT_PUSH, file);
        b.emit1(OpCode::CONSTANT_PUSH, code);
        common::gref_invoke(b, "%dump-code", 2);
    })
    .unwrap();

    let written = std::fs::read(&path).unwrap();
    let mut expected = Vec::new();
    dump_code(
        &mut expected,
        &[OpCode::IM_ONE as u16, OpCode::END_OF_CODE as u16],
    )
    .unwrap();
    assert_eq!(written, expected);
    let _ = std::fs::remove_file(path);
}
