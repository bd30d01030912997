//! Bytecode container loading and dumping for the Skein VM.
//!
//! A bytecode file starts with the runtime marker symbol and a version
//! datum, followed by phrases. Each phrase is a readable constant vector,
//! the code size as a decimal integer, one separator character, and
//! `2 * size` raw bytes holding the instruction words as big-endian
//! pairs. Phrases execute against the current module as they are read.

use std::io::Write;
use std::path::Path;

use log::debug;

use crate::code::CodeChunk;
use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::reader::Reader;
use crate::value::Value;

/// Marker symbol identifying Skein bytecode containers.
pub const BYTECODE_MARKER: &str = "skein";

/// Writes a code vector in container phrase framing: the size, a
/// newline, and the instruction words as big-endian byte pairs.
pub fn dump_code<W: Write>(out: &mut W, words: &[u16]) -> VmResult<()> {
    let io_err = |e: std::io::Error| VmError::io(e.to_string());
    writeln!(out, "{}", words.len()).map_err(io_err)?;
    for word in words {
        out.write_all(&word.to_be_bytes()).map_err(io_err)?;
    }
    out.write_all(b"\n").map_err(io_err)?;
    Ok(())
}

/// Reads one phrase's instruction words: a separator character followed
/// by `size` big-endian pairs.
fn read_code(reader: &mut Reader<'_>, size: usize) -> VmResult<Vec<u16>> {
    reader.read_raw_byte()?;
    let bytes = reader.read_raw_bytes(2 * size)?;
    let mut words = Vec::with_capacity(size);
    for pair in bytes.chunks_exact(2) {
        words.push(u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(words)
}

/// Loads and executes the phrases of an already-identified bytecode
/// stream. Returns `Ok(false)` when a phrase carries a negative code
/// size before the system has booted, which is how candidate files are
/// probed; the same situation after boot is an error.
pub fn load_bytecode(engine: &mut Engine, bytes: &[u8]) -> VmResult<bool> {
    let mut reader = Reader::new(bytes);
    loop {
        let Some(constants) = reader.try_read_datum()? else {
            return Ok(true);
        };
        if !matches!(constants, Value::Vector(_)) {
            return Err(VmError::bad_bytecode("phrase constants are not a vector"));
        }

        let size = match reader.read_datum()? {
            Value::Fixnum(n) if n >= 0 => n as usize,
            Value::Fixnum(_) => {
                if engine.is_booted() {
                    return Err(VmError::bad_bytecode("negative phrase code size"));
                }
                return Ok(false);
            }
            other => {
                return Err(VmError::bad_bytecode(format!(
                    "phrase code size is {other}"
                )))
            }
        };

        let words = read_code(&mut reader, size)?;
        debug!("executing phrase: {size} instruction words");
        engine.execute(CodeChunk::new(words), constants, None)?;
    }
}

/// Loads a bytecode file and boots the engine on it. The file must
/// start with the runtime marker symbol and a version datum.
pub fn load_boot_file<P: AsRef<Path>>(engine: &mut Engine, path: P) -> VmResult<()> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| VmError::io(format!("{}: {e}", path.display())))?;

    let mut reader = Reader::new(&bytes);
    match reader.try_read_datum()? {
        Some(Value::Symbol(marker)) if marker.as_str() == BYTECODE_MARKER => {}
        _ => {
            return Err(VmError::bad_bytecode(format!(
                "{} is not a {BYTECODE_MARKER} bytecode file",
                path.display()
            )))
        }
    }
    // The version datum is read but not interpreted.
    reader.read_datum()?;

    let rest = &bytes[reader.pos()..];
    if !load_bytecode(engine, rest)? {
        return Err(VmError::bad_bytecode(format!(
            "{}: negative code size in boot file",
            path.display()
        )));
    }
    engine.set_booted();
    debug!("booted from {}", path.display());
    Ok(())
}

/// Boots from a statically embedded image: constants as reader source,
/// code as an in-memory instruction array.
pub fn boot_from_image(engine: &mut Engine, constants_src: &str, code: &[u16]) -> VmResult<Value> {
    let constants = Reader::new(constants_src.as_bytes()).read_datum()?;
    if !matches!(constants, Value::Vector(_)) {
        return Err(VmError::bad_bytecode("boot constants are not a vector"));
    }
    let result = engine.execute(CodeChunk::new(code.to_vec()), constants, None)?;
    engine.set_booted();
    Ok(result)
}
