use std::path::Path;

use anyhow::{Context, Result, bail};

use super::mapper::Mirroring;

const INES_MAGIC: [u8; 4] = [0x4E, 0x45, 0x53, 0x1A];
const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_BANK_LEN: usize = 16 * 1024;
const CHR_BANK_LEN: usize = 8 * 1024;

#[derive(Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub prg_rom: Vec<u8>,
    pub chr: Vec<u8>,
    pub chr_is_ram: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            bail!("ROM too small for an iNES header: {} bytes", data.len());
        }
        if data[0..4] != INES_MAGIC {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let prg_banks = data[4] as usize;
        let chr_banks = data[5] as usize;
        let control1 = data[6];
        let control2 = data[7];

        // Mapper id is split across the high nibbles of the two control bytes.
        let mapper_id = (control1 >> 4) | (control2 & 0xF0);
        let mirroring = decode_mirroring(control1);

        if prg_banks == 0 {
            bail!("invalid PRG ROM: bank count is zero");
        }

        let mut offset = HEADER_LEN;
        if control1 & 0x04 != 0 {
            // The trainer block carries no emulated state.
            offset += TRAINER_LEN;
        }

        let prg_len = prg_banks * PRG_BANK_LEN;
        if data.len() < offset + prg_len {
            bail!(
                "ROM truncated: PRG needs {} bytes at offset {}, have {}",
                prg_len,
                offset,
                data.len()
            );
        }
        let prg_rom = data[offset..offset + prg_len].to_vec();
        offset += prg_len;

        let (chr, chr_is_ram) = if chr_banks == 0 {
            // No CHR in the image: substitute 8 KiB of writable pattern memory.
            (vec![0; CHR_BANK_LEN], true)
        } else {
            let chr_len = chr_banks * CHR_BANK_LEN;
            if data.len() < offset + chr_len {
                bail!(
                    "ROM truncated: CHR needs {} bytes at offset {}, have {}",
                    chr_len,
                    offset,
                    data.len()
                );
            }
            (data[offset..offset + chr_len].to_vec(), false)
        };

        Ok(Cartridge {
            mapper_id,
            mirroring,
            prg_rom,
            chr,
            chr_is_ram,
        })
    }
}

fn decode_mirroring(control1: u8) -> Mirroring {
    // Bit 0 selects horizontal/vertical; bit 3 forces a single-screen layout.
    let index = (control1 & 0x01) | (((control1 >> 3) & 0x01) << 1);
    match index {
        0 => Mirroring::Horizontal,
        1 => Mirroring::Vertical,
        2 => Mirroring::OneScreenLower,
        _ => Mirroring::OneScreenUpper,
    }
}
