//! Binary `.ae0` pipe model files.
//!
//! Layout (all numbers little-endian):
//!
//! | offset | size | content |
//! |---|---|---|
//! | 0 | 32 | header: `AEOLUS`, version at 7, harmonic count at 26, note range at 28/29, frequency ratio at 30/31 |
//! | 32 | 160 | name (32), copyright (56), mnemonic (8), comments (56), reserved (8); NUL padded |
//! | 192 | 48 × k | note functions: volume, offset, randomisation, then (version 2) instability, attack, attack detune, release, release detune |
//! | … | 48 × n × 4 | harmonic functions: level, randomisation, attack, attack profile |
//!
//! Each function record is an `i32` set-point mask followed by `N_NOTES` `f32` values.

use std::io::{self, Read, Write};

use super::{HarmonicFunc, NoteFunc, PipeModel};
use crate::consts::{deprecated, N_HARM, N_NOTES, NOTE_MAX};
use crate::error::ModelError;

const SIGNATURE: &[u8; 6] = b"AEOLUS";
const HEADER_LENGTH: usize = 32;
const NAME_LENGTH: usize = 32;
const COPYRIGHT_LENGTH: usize = 56;
const MNEMONIC_LENGTH: usize = 8;
const COMMENTS_LENGTH: usize = 56;
const RESERVED_LENGTH: usize = 8;

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), ModelError> {
    reader.read_exact(buf).map_err(|_| ModelError::Truncated { what })
}

fn read_string<R: Read, const L: usize>(reader: &mut R, what: &'static str) -> Result<String, ModelError> {
    let mut buf = [0u8; L];
    read_exact(reader, &mut buf, what)?;
    buf[L - 1] = 0;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(L);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn read_func<R: Read>(reader: &mut R, what: &'static str) -> Result<NoteFunc, ModelError> {
    let mut buf = [0u8; 4 * (1 + N_NOTES)];
    read_exact(reader, &mut buf, what)?;

    let word = |i: usize| [buf[4 * i], buf[4 * i + 1], buf[4 * i + 2], buf[4 * i + 3]];
    let mask = i32::from_le_bytes(word(0)) as u32;
    let mut values = [0.0; N_NOTES];
    for (i, v) in values.iter_mut().enumerate() {
        *v = f32::from_le_bytes(word(i + 1));
    }
    Ok(NoteFunc::from_raw(mask, values))
}

fn read_harmonics<R: Read>(
    reader: &mut R,
    func: &mut HarmonicFunc,
    n_harm: usize,
    what: &'static str,
) -> Result<(), ModelError> {
    for h in 0..n_harm {
        let f = read_func(reader, what)?;
        if let Some(dst) = func.harmonic_mut(h) {
            *dst = f;
        }
    }
    Ok(())
}

/// Read a model. The name stored in the file is kept; callers loading from
/// disk usually rename it after the file.
pub fn read<R: Read>(mut reader: R) -> Result<PipeModel, ModelError> {
    let mut header = [0u8; HEADER_LENGTH];
    read_exact(&mut reader, &mut header, "header")?;
    if &header[..SIGNATURE.len()] != SIGNATURE {
        return Err(ModelError::BadSignature);
    }

    let version = header[7];
    let n_harm = match header[26] as usize {
        0 => deprecated::N_HARM,
        n => n,
    };
    let note_min = header[28];
    let note_max = match header[29] {
        deprecated::NOTE_MAX => NOTE_MAX,
        n => n,
    };

    let mut m = PipeModel::default();
    m.set_note_range(note_min, note_max)?;
    m.set_ratio(header[30], header[31])?;

    m.name = read_string::<_, NAME_LENGTH>(&mut reader, "name")?;
    m.copyright = read_string::<_, COPYRIGHT_LENGTH>(&mut reader, "copyright")?;
    m.mnemonic = read_string::<_, MNEMONIC_LENGTH>(&mut reader, "mnemonic")?;
    m.comments = read_string::<_, COMMENTS_LENGTH>(&mut reader, "comments")?;
    read_string::<_, RESERVED_LENGTH>(&mut reader, "reserved field")?;

    m.n_vol = read_func(&mut reader, "volume")?;
    m.n_off = read_func(&mut reader, "offset")?;
    m.n_ran = read_func(&mut reader, "randomisation")?;
    if version >= PipeModel::VERSION {
        m.n_ins = read_func(&mut reader, "instability")?;
        m.n_att = read_func(&mut reader, "attack")?;
        m.n_atd = read_func(&mut reader, "attack detune")?;
        m.n_dct = read_func(&mut reader, "release")?;
        m.n_dcd = read_func(&mut reader, "release detune")?;
    }

    // Files with more harmonics than we synthesize are read in full so the
    // records stay aligned, extra harmonics are dropped.
    read_harmonics(&mut reader, &mut m.h_lev, n_harm, "harmonic levels")?;
    read_harmonics(&mut reader, &mut m.h_ran, n_harm, "harmonic randomisation")?;
    read_harmonics(&mut reader, &mut m.h_att, n_harm, "harmonic attack")?;
    read_harmonics(&mut reader, &mut m.h_atp, n_harm, "harmonic attack profile")?;

    Ok(m)
}

fn write_string<W: Write, const L: usize>(writer: &mut W, s: &str) -> io::Result<()> {
    let mut buf = [0u8; L];
    let bytes = s.as_bytes();
    let n = bytes.len().min(L - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    writer.write_all(&buf)
}

fn write_func<W: Write>(writer: &mut W, f: &NoteFunc) -> io::Result<()> {
    writer.write_all(&(f.mask() as i32).to_le_bytes())?;
    for v in f.values() {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Write a model in the current format version.
pub fn write<W: Write>(model: &PipeModel, mut writer: W) -> io::Result<()> {
    let mut header = [0u8; HEADER_LENGTH];
    header[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
    header[7] = PipeModel::VERSION;
    header[26] = N_HARM as u8;
    header[28] = model.note_min();
    header[29] = model.note_max();
    header[30] = model.fn_();
    header[31] = model.fd();
    writer.write_all(&header)?;

    write_string::<_, NAME_LENGTH>(&mut writer, &model.name)?;
    write_string::<_, COPYRIGHT_LENGTH>(&mut writer, &model.copyright)?;
    write_string::<_, MNEMONIC_LENGTH>(&mut writer, &model.mnemonic)?;
    write_string::<_, COMMENTS_LENGTH>(&mut writer, &model.comments)?;
    write_string::<_, RESERVED_LENGTH>(&mut writer, "")?;

    for f in [
        &model.n_vol,
        &model.n_off,
        &model.n_ran,
        &model.n_ins,
        &model.n_att,
        &model.n_atd,
        &model.n_dct,
        &model.n_dcd,
    ] {
        write_func(&mut writer, f)?;
    }

    for func in [&model.h_lev, &model.h_ran, &model.h_att, &model.h_atp] {
        for f in func.iter() {
            write_func(&mut writer, f)?;
        }
    }
    Ok(())
}

pub fn to_bytes(model: &PipeModel) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write(model, &mut out);
    out
}

pub fn from_bytes(bytes: &[u8]) -> Result<PipeModel, ModelError> {
    read(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;

    const RECORD: usize = 4 * (1 + N_NOTES);

    #[test]
    fn binary_round_trip() {
        let reg = ModelRegistry::builtin();
        let model = reg.get("Gedackt 8").expect("builtin");
        let bytes = to_bytes(model);
        assert_eq!(bytes.len(), HEADER_LENGTH + 160 + RECORD * (8 + 4 * N_HARM));
        assert_eq!(&bytes[..6], b"AEOLUS");

        let back = from_bytes(&bytes).expect("read");
        assert_eq!(&back, model.as_ref());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = to_bytes(&PipeModel::new("x"));
        bytes[0] = b'X';
        assert_eq!(from_bytes(&bytes), Err(ModelError::BadSignature));
    }

    #[test]
    fn reports_truncation() {
        let bytes = to_bytes(&PipeModel::new("x"));
        let err = from_bytes(&bytes[..HEADER_LENGTH + 40]).expect_err("truncated");
        assert_eq!(err, ModelError::Truncated { what: "copyright" });
    }

    #[test]
    fn reads_legacy_version_one() {
        // Version 1, 48 harmonics, old upper note limit.
        let mut bytes = vec![0u8; HEADER_LENGTH];
        bytes[..6].copy_from_slice(b"AEOLUS");
        bytes[7] = 1;
        bytes[26] = 0;
        bytes[28] = 36;
        bytes[29] = deprecated::NOTE_MAX;
        bytes[30] = 2;
        bytes[31] = 1;
        bytes.extend(std::iter::repeat_n(0u8, 160));

        let mut func = Vec::new();
        func.extend((1u32 << 4).to_le_bytes());
        for _ in 0..N_NOTES {
            func.extend((-6.0f32).to_le_bytes());
        }
        for _ in 0..3 + 4 * deprecated::N_HARM {
            bytes.extend(&func);
        }

        let m = from_bytes(&bytes).expect("legacy file");
        assert_eq!(m.note_max(), NOTE_MAX);
        assert_eq!(m.fn_(), 2);
        assert_eq!(m.note_volume(0), -6.0);
        assert_eq!(m.note_attack(0), 0.01, "version 1 has no attack function");
        assert_eq!(m.harmonic_level(47, 0), -6.0);
        assert_eq!(m.harmonic_level(48, 0), -100.0);
    }
}
