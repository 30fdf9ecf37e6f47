use anyhow::{Result, bail};

use super::cartridge::Cartridge;

// Nametable layout, decoded from the cartridge header. AxROM rewires it at
// runtime through its bank-select register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
}

// A mapper owns the cartridge and serves both bus windows: pattern memory
// below 0x2000 for the PPU and program memory from 0x8000 up for the CPU.
// Accesses outside a variant's windows are ignored and recorded as a one-line
// diagnostic that the system drains into its debug-event ring.
pub(crate) trait Mapper {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    // Side-effect-free variant of read for inspection tooling.
    fn peek(&self, addr: u16) -> u8;
    fn mirroring(&self) -> Mirroring;
    fn name(&self) -> &'static str;
    fn debug_state(&self) -> String;
    // Drains the diagnostic recorded by the last out-of-window access.
    fn take_debug_event(&mut self) -> Option<String> {
        None
    }
}

pub(crate) fn create_mapper(cart: Cartridge) -> Result<Box<dyn Mapper>> {
    match cart.mapper_id {
        0 | 2 => Ok(Box::new(Mapper2::new(cart))),
        3 => Ok(Box::new(Mapper3::new(cart))),
        7 => Ok(Box::new(Mapper7::new(cart))),
        id => bail!("unsupported mapper {id}"),
    }
}

fn out_of_window(name: &str, kind: &str, addr: u16) -> String {
    format!("{name}: ignored {kind} at {addr:04X}")
}

fn chr_kind(cart: &Cartridge) -> &'static str {
    if cart.chr_is_ram { "ram" } else { "rom" }
}

// Mapper 0/2 (NROM/UxROM): switchable 16 KiB PRG window at 0x8000, last bank
// fixed at 0xC000, flat CHR. NROM is the degenerate case that never banks.
pub(crate) struct Mapper2 {
    cart: Cartridge,
    prg_banks: usize,
    prg_bank1: usize,
    prg_bank2: usize,
    mirroring: Mirroring,
    pending_event: Option<String>,
}

impl Mapper2 {
    pub(crate) fn new(cart: Cartridge) -> Self {
        let prg_banks = cart.prg_rom.len() / 0x4000;
        let mirroring = cart.mirroring;
        Mapper2 {
            cart,
            prg_banks,
            prg_bank1: 0,
            prg_bank2: prg_banks - 1,
            mirroring,
            pending_event: None,
        }
    }
}

impl Mapper for Mapper2 {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF | 0x8000..=0xFFFF => self.peek(addr),
            _ => {
                self.pending_event = Some(out_of_window(self.name(), "read", addr));
                0
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.cart.chr[addr as usize] = value,
            0x8000..=0xFFFF => self.prg_bank1 = value as usize % self.prg_banks,
            _ => self.pending_event = Some(out_of_window(self.name(), "write", addr)),
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.cart.chr[addr as usize],
            0x8000..=0xBFFF => self.cart.prg_rom[self.prg_bank1 * 0x4000 + (addr as usize - 0x8000)],
            0xC000..=0xFFFF => self.cart.prg_rom[self.prg_bank2 * 0x4000 + (addr as usize - 0xC000)],
            _ => 0,
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn name(&self) -> &'static str {
        if self.cart.mapper_id == 0 { "NROM" } else { "UxROM" }
    }

    fn debug_state(&self) -> String {
        format!(
            "prg_bank1={} prg_bank2={} prg_banks={} chr={}",
            self.prg_bank1,
            self.prg_bank2,
            self.prg_banks,
            chr_kind(&self.cart)
        )
    }

    fn take_debug_event(&mut self) -> Option<String> {
        self.pending_event.take()
    }
}

// Mapper 3 (CNROM): 8 KiB CHR banks selected by the low two bits of any
// program-space write; PRG laid out like NROM.
pub(crate) struct Mapper3 {
    cart: Cartridge,
    chr_banks: usize,
    chr_bank: usize,
    prg_banks: usize,
    prg_bank1: usize,
    prg_bank2: usize,
    mirroring: Mirroring,
    pending_event: Option<String>,
}

impl Mapper3 {
    pub(crate) fn new(cart: Cartridge) -> Self {
        let chr_banks = (cart.chr.len() / 0x2000).max(1);
        let prg_banks = cart.prg_rom.len() / 0x4000;
        let mirroring = cart.mirroring;
        Mapper3 {
            cart,
            chr_banks,
            chr_bank: 0,
            prg_banks,
            prg_bank1: 0,
            prg_bank2: prg_banks - 1,
            mirroring,
            pending_event: None,
        }
    }
}

impl Mapper for Mapper3 {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF | 0x8000..=0xFFFF => self.peek(addr),
            _ => {
                self.pending_event = Some(out_of_window(self.name(), "read", addr));
                0
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => {
                self.cart.chr[self.chr_bank * 0x2000 + addr as usize] = value;
            }
            // Select wraps to the banks actually present.
            0x8000..=0xFFFF => self.chr_bank = (value & 0x03) as usize % self.chr_banks,
            _ => self.pending_event = Some(out_of_window(self.name(), "write", addr)),
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.cart.chr[self.chr_bank * 0x2000 + addr as usize],
            0x8000..=0xBFFF => self.cart.prg_rom[self.prg_bank1 * 0x4000 + (addr as usize - 0x8000)],
            0xC000..=0xFFFF => self.cart.prg_rom[self.prg_bank2 * 0x4000 + (addr as usize - 0xC000)],
            _ => 0,
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn name(&self) -> &'static str {
        "CNROM"
    }

    fn debug_state(&self) -> String {
        format!(
            "chr_bank={} chr_banks={} prg_banks={} chr={}",
            self.chr_bank,
            self.chr_banks,
            self.prg_banks,
            chr_kind(&self.cart)
        )
    }

    fn take_debug_event(&mut self) -> Option<String> {
        self.pending_event.take()
    }
}

// Mapper 7 (AxROM): one switchable 32 KiB PRG window; bits 0-2 of a
// program-space write select the bank, bit 4 picks the single-screen
// nametable page. The only variant that changes mirroring at runtime.
pub(crate) struct Mapper7 {
    cart: Cartridge,
    prg_banks: usize,
    prg_bank: usize,
    mirroring: Mirroring,
    pending_event: Option<String>,
}

impl Mapper7 {
    pub(crate) fn new(cart: Cartridge) -> Self {
        let prg_banks = (cart.prg_rom.len() / 0x8000).max(1);
        let mirroring = cart.mirroring;
        Mapper7 {
            cart,
            prg_banks,
            prg_bank: 0,
            mirroring,
            pending_event: None,
        }
    }
}

impl Mapper for Mapper7 {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF | 0x8000..=0xFFFF => self.peek(addr),
            _ => {
                self.pending_event = Some(out_of_window(self.name(), "read", addr));
                0
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.cart.chr[addr as usize] = value,
            0x8000..=0xFFFF => {
                self.prg_bank = (value & 0x07) as usize % self.prg_banks;
                self.mirroring = if value & 0x10 != 0 {
                    Mirroring::OneScreenUpper
                } else {
                    Mirroring::OneScreenLower
                };
            }
            _ => self.pending_event = Some(out_of_window(self.name(), "write", addr)),
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.cart.chr[addr as usize],
            0x8000..=0xFFFF => {
                // An undersized PRG image mirrors through the 32 KiB window.
                let index = self.prg_bank * 0x8000 + (addr as usize - 0x8000);
                self.cart.prg_rom[index % self.cart.prg_rom.len()]
            }
            _ => 0,
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    fn name(&self) -> &'static str {
        "AxROM"
    }

    fn debug_state(&self) -> String {
        format!(
            "prg_bank={} prg_banks={} mirroring={:?} chr={}",
            self.prg_bank,
            self.prg_banks,
            self.mirroring,
            chr_kind(&self.cart)
        )
    }

    fn take_debug_event(&mut self) -> Option<String> {
        self.pending_event.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0; total_size];
        for (index, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill(index as u8 + 1);
        }
        data
    }

    fn make_cart(mapper_id: u8, prg: Vec<u8>, chr: Vec<u8>) -> Cartridge {
        Cartridge {
            mapper_id,
            mirroring: Mirroring::Vertical,
            prg_rom: prg,
            chr,
            chr_is_ram: false,
        }
    }

    #[test]
    fn nrom_single_bank_reads_same_data_in_both_windows() {
        let cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        assert_eq!(mapper.read(0x8000), 1);
        assert_eq!(mapper.read(0xC000), 1);
        assert_eq!(mapper.read(0xFFFF), 1);
    }

    #[test]
    fn uxrom_switches_low_bank_and_keeps_last_fixed() {
        let cart = make_cart(2, patterned_banks(4 * 0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        assert_eq!(mapper.read(0x8000), 1);
        assert_eq!(mapper.read(0xC000), 4);
        mapper.write(0x8000, 2);
        assert_eq!(mapper.read(0x8000), 3);
        assert_eq!(mapper.read(0xC000), 4);
    }

    #[test]
    fn uxrom_bank_select_wraps_modulo_bank_count() {
        let cart = make_cart(2, patterned_banks(4 * 0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        mapper.write(0xFFFF, 5);
        assert_eq!(mapper.read(0x8000), 2);
    }

    #[test]
    fn cnrom_switches_chr_banks_masked_to_two_bits() {
        let cart = make_cart(
            3,
            patterned_banks(0x8000, 0x4000),
            patterned_banks(4 * 0x2000, 0x2000),
        );
        let mut mapper = Mapper3::new(cart);
        assert_eq!(mapper.read(0x0000), 1);
        mapper.write(0x8000, 2);
        assert_eq!(mapper.read(0x0000), 3);
        mapper.write(0x8000, 0xFF);
        assert_eq!(mapper.read(0x0000), 4);
    }

    #[test]
    fn cnrom_select_wraps_to_available_banks() {
        let cart = make_cart(
            3,
            patterned_banks(0x8000, 0x4000),
            patterned_banks(2 * 0x2000, 0x2000),
        );
        let mut mapper = Mapper3::new(cart);
        mapper.write(0x8000, 3);
        assert_eq!(mapper.read(0x0000), 2);
    }

    #[test]
    fn axrom_switches_32k_banks_and_overrides_mirroring() {
        let cart = make_cart(7, patterned_banks(4 * 0x8000, 0x8000), vec![0; 0x2000]);
        let mut mapper = Mapper7::new(cart);
        assert_eq!(mapper.read(0x8000), 1);
        assert_eq!(mapper.mirroring(), Mirroring::Vertical);
        mapper.write(0x8000, 0x12);
        assert_eq!(mapper.read(0x8000), 3);
        assert_eq!(mapper.read(0xFFFF), 3);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenUpper);
        mapper.write(0x8000, 0x01);
        assert_eq!(mapper.mirroring(), Mirroring::OneScreenLower);
    }

    #[test]
    fn chr_ram_writes_read_back() {
        let cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        mapper.write(0x1234, 0x5A);
        assert_eq!(mapper.read(0x1234), 0x5A);
    }

    #[test]
    fn debug_state_reports_chr_kind() {
        let mut cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        cart.chr_is_ram = true;
        assert!(Mapper2::new(cart).debug_state().contains("chr=ram"));

        let cart = make_cart(
            3,
            patterned_banks(0x8000, 0x4000),
            patterned_banks(0x2000, 0x2000),
        );
        assert!(Mapper3::new(cart).debug_state().contains("chr=rom"));

        let mut cart = make_cart(7, patterned_banks(0x8000, 0x8000), vec![0; 0x2000]);
        cart.chr_is_ram = true;
        assert!(Mapper7::new(cart).debug_state().contains("chr=ram"));
    }

    #[test]
    fn out_of_window_access_records_one_event() {
        let cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        assert!(mapper.take_debug_event().is_none());
        assert_eq!(mapper.read(0x6000), 0);
        let event = mapper.take_debug_event().unwrap();
        assert!(event.contains("6000"));
        assert!(mapper.take_debug_event().is_none());
    }

    #[test]
    fn peek_is_silent_on_unmapped_addresses() {
        let cart = make_cart(0, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = Mapper2::new(cart);
        assert_eq!(mapper.peek(0x6000), 0);
        assert!(mapper.take_debug_event().is_none());
    }

    #[test]
    fn factory_rejects_unknown_mapper() {
        let cart = make_cart(4, patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        assert!(create_mapper(cart).is_err());
    }

    #[test]
    fn factory_builds_all_supported_variants() {
        for id in [0u8, 2, 3, 7] {
            let cart = make_cart(id, patterned_banks(0x8000, 0x4000), vec![0; 0x2000]);
            let mapper = create_mapper(cart).unwrap();
            assert!(!mapper.name().is_empty());
        }
    }
}
