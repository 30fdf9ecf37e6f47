pub mod cartridge;
pub mod mapper;

mod cpu;
mod palette;
mod ppu;

use anyhow::Result;
use std::{collections::VecDeque, path::Path};

pub use cartridge::Cartridge;
pub use mapper::Mirroring;
pub use ppu::{FRAME_HEIGHT, FRAME_WIDTH};

use mapper::{Mapper, create_mapper};
use ppu::Ppu;

pub const CPU_FREQ: u32 = 1_789_773;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

// One-slot interrupt latch, drained at the next instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    None,
    Nmi,
    Irq,
}

pub struct Nes {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) p: u8,
    pub(crate) sp: u8,
    pub(crate) pc: u16,

    pub(crate) ram: [u8; 2048],
    pub(crate) ppu: Ppu,
    pub(crate) mapper: Option<Box<dyn Mapper>>,

    mapper_name: String,

    controller_state: u8,
    controller_index: u8,
    controller2_state: u8,
    controller2_index: u8,
    controller_strobe: bool,

    pub(crate) interrupt: Interrupt,
    pub(crate) dma_cycles: u32,
    pub(crate) total_cycles: u64,
    pub(crate) instruction_count: u64,
    debug_events: VecDeque<String>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            ram: [0; 2048],
            ppu: Ppu::new(),
            mapper: None,
            mapper_name: "No ROM loaded".to_string(),
            controller_state: 0,
            controller_index: 0,
            controller2_state: 0,
            controller2_index: 0,
            controller_strobe: false,
            interrupt: Interrupt::None,
            dma_cycles: 0,
            total_cycles: 0,
            instruction_count: 0,
            debug_events: VecDeque::with_capacity(512),
        }
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn has_rom(&self) -> bool {
        self.mapper.is_some()
    }

    // Most recently completed frame as RGBA8, row-major, 256x240.
    pub fn frame_buffer(&self) -> &[u8] {
        self.ppu.frame_buffer()
    }

    pub fn frame_count(&self) -> u64 {
        self.ppu.frame_count()
    }

    pub fn set_controller_state(&mut self, state: u8) {
        self.controller_state = state;
    }

    pub fn set_controller2_state(&mut self, state: u8) {
        self.controller2_state = state;
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.insert_cartridge(cart)
    }

    pub fn insert_cartridge(&mut self, cart: Cartridge) -> Result<()> {
        let mapper_id = cart.mapper_id;
        let mapper = create_mapper(cart)?;
        self.mapper_name = format!("{} (mapper {mapper_id})", mapper.name());
        self.mapper = Some(mapper);
        self.reset();
        self.push_debug_event(format!("ROM loaded: {}", self.mapper_name));
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.mapper.is_none() {
            return;
        }

        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.sp = 0xFD;
        self.interrupt = Interrupt::None;
        self.dma_cycles = 0;
        self.total_cycles = 0;
        self.instruction_count = 0;
        self.controller_index = 0;
        self.controller2_index = 0;
        self.controller_strobe = false;
        self.debug_events.clear();
        self.ppu.reset();

        self.pc = self.read_u16(0xFFFC);
        self.push_debug_event(format!("CPU reset, PC=${:04X}", self.pc));
    }

    // Runs whole instructions until the frame counter advances. Returns the
    // CPU cycles consumed.
    pub fn run_frame(&mut self) -> u32 {
        if self.mapper.is_none() {
            return 0;
        }

        let frame = self.ppu.frame_count();
        let mut cycles = 0;
        while self.ppu.frame_count() == frame {
            cycles += self.step_instruction();
        }
        cycles
    }

    // Runs whole instructions until at least budget CPU cycles have elapsed.
    // Returns the cycles actually consumed, which may overshoot by one
    // instruction.
    pub fn run_cycles(&mut self, budget: u32) -> u32 {
        if self.mapper.is_none() {
            return 0;
        }

        let mut cycles = 0;
        while cycles < budget {
            cycles += self.step_instruction();
        }
        cycles
    }

    // Executes one CPU instruction (or one stalled cycle, or one interrupt
    // entry) and keeps the pixel clock phase-locked at three ticks per CPU
    // cycle.
    pub fn step_instruction(&mut self) -> u32 {
        if self.mapper.is_none() {
            return 0;
        }

        let cycles = self.step_cpu();
        for _ in 0..cycles * 3 {
            self.tick_ppu();
        }
        cycles
    }

    fn tick_ppu(&mut self) {
        if let Some(mapper) = self.mapper.as_mut() {
            self.ppu.tick(mapper.as_mut());
        }
        if self.ppu.take_nmi() {
            self.request_nmi();
        }
    }

    // Latches a non-maskable interrupt for the next instruction boundary.
    // Overrides a pending IRQ.
    pub fn request_nmi(&mut self) {
        self.interrupt = Interrupt::Nmi;
    }

    // Latches a maskable interrupt unless interrupts are disabled. The flag
    // is checked again at service time.
    pub fn request_irq(&mut self) {
        if !self.get_flag(FLAG_INTERRUPT) {
            self.interrupt = Interrupt::Irq;
        }
    }

    // Side-effect-free bus read for tooling. Registers with read side
    // effects are not consulted and yield zero.
    pub fn debug_read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x6000..=0xFFFF => self.mapper.as_ref().map_or(0, |m| m.peek(addr)),
            _ => 0,
        }
    }

    pub fn debug_cpu_regs(&self) -> (u8, u8, u8, u8, u8, u16) {
        (self.a, self.x, self.y, self.p, self.sp, self.pc)
    }

    pub fn debug_total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn debug_instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn debug_pending_interrupt(&self) -> &'static str {
        match self.interrupt {
            Interrupt::None => "none",
            Interrupt::Nmi => "NMI",
            Interrupt::Irq => "IRQ",
        }
    }

    pub fn debug_ppu_timing(&self) -> (u64, u16, u16) {
        self.ppu.debug_timing()
    }

    pub fn debug_peek_vram(&self, index: usize) -> u8 {
        self.ppu.debug_peek_vram(index)
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.ppu.debug_peek_palette(index)
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.ppu.debug_peek_oam(index)
    }

    pub fn debug_mapper_state(&self) -> String {
        if let Some(mapper) = self.mapper.as_ref() {
            let state = mapper.debug_state();
            if state.is_empty() { self.mapper_name.clone() } else { state }
        } else {
            "No mapper".to_string()
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        const MAX_DEBUG_EVENTS: usize = 512;
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    pub(crate) fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_read_register(reg, mapper.as_mut())
                } else {
                    0
                }
            }
            0x4016 => self.read_controller_1(),
            0x4017 => self.read_controller_2(),
            0x4000..=0x5FFF => 0,
            _ => {
                let value = self.mapper.as_mut().map_or(0, |m| m.read(addr));
                self.drain_mapper_event();
                value
            }
        }
    }

    pub(crate) fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                if let Some(mapper) = self.mapper.as_mut() {
                    self.ppu.cpu_write_register(reg, value, mapper.as_mut());
                }
            }
            0x4014 => self.do_oam_dma(value),
            0x4016 => self.write_controller_strobe(value),
            0x4000..=0x5FFF => {}
            _ => {
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.write(addr, value);
                }
                self.drain_mapper_event();
            }
        }
    }

    fn drain_mapper_event(&mut self) {
        if let Some(event) = self.mapper.as_mut().and_then(|m| m.take_debug_event()) {
            self.push_debug_event(event);
        }
    }

    fn read_controller_1(&mut self) -> u8 {
        let mut value = 0;
        if self.controller_index < 8 && self.controller_state & (1 << self.controller_index) != 0 {
            value = 1;
        }
        self.controller_index = self.controller_index.wrapping_add(1);
        if self.controller_strobe {
            self.controller_index = 0;
        }
        value
    }

    fn read_controller_2(&mut self) -> u8 {
        let mut value = 0;
        if self.controller2_index < 8 && self.controller2_state & (1 << self.controller2_index) != 0
        {
            value = 1;
        }
        self.controller2_index = self.controller2_index.wrapping_add(1);
        if self.controller_strobe {
            self.controller2_index = 0;
        }
        value
    }

    // A single strobe write drives both ports.
    fn write_controller_strobe(&mut self, value: u8) {
        self.controller_strobe = value & 0x01 != 0;
        if self.controller_strobe {
            self.controller_index = 0;
            self.controller2_index = 0;
        }
    }

    fn do_oam_dma(&mut self, page: u8) {
        let base = u16::from(page) << 8;
        let mut bytes = [0u8; 256];
        for (index, slot) in bytes.iter_mut().enumerate() {
            *slot = self.cpu_read(base.wrapping_add(index as u16));
        }
        self.ppu.write_oam_dma(&bytes);

        // 513 stalled CPU cycles, one more when the write lands on an odd
        // cycle.
        let stall = 513 + (self.total_cycles & 1) as u32;
        self.dma_cycles += stall;
        self.push_debug_event(format!("OAM DMA page=${page:02X} stall={stall}"));
    }

    pub(crate) fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    // Indirect reads never carry into the high address byte.
    pub(crate) fn read_u16_bug(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.cpu_read(hi_addr) as u16;
        (hi << 8) | lo
    }

    pub(crate) fn push(&mut self, value: u8) {
        let addr = 0x0100 | self.sp as u16;
        self.cpu_write(addr, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    pub(crate) fn pop(&mut self) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        let addr = 0x0100 | self.sp as u16;
        self.cpu_read(addr)
    }

    pub(crate) fn push_u16(&mut self, value: u16) {
        self.push((value >> 8) as u8);
        self.push(value as u8);
    }

    pub(crate) fn pop_u16(&mut self) -> u16 {
        let lo = self.pop() as u16;
        let hi = self.pop() as u16;
        (hi << 8) | lo
    }

    pub(crate) fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub(crate) fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    pub(crate) fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    pub(crate) fn service_nmi(&mut self) {
        self.push_u16(self.pc);
        self.push((self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(0xFFFA);
        self.total_cycles += 7;
    }

    pub(crate) fn service_irq(&mut self) {
        self.push_u16(self.pc);
        self.push((self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(0xFFFE);
        self.total_cycles += 7;
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::nes_with_program;
    use super::*;

    #[test]
    fn reset_loads_the_vector_and_power_on_registers() {
        let nes = nes_with_program(&[]);
        let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
        assert_eq!(pc, 0x8000);
        assert_eq!(sp, 0xFD);
        assert_eq!(p, FLAG_INTERRUPT | FLAG_UNUSED);
        assert_eq!((a, x, y), (0, 0, 0));
        assert_eq!(nes.debug_total_cycles(), 0);
        assert_eq!(nes.debug_read(0xFFFC), 0x00);
        assert_eq!(nes.debug_read(0xFFFD), 0x80);
    }

    #[test]
    fn internal_ram_mirrors_every_two_kilobytes() {
        let mut nes = nes_with_program(&[]);
        nes.cpu_write(0x0000, 0xAA);
        for addr in [0x0800u16, 0x1000, 0x1800] {
            assert_eq!(nes.debug_read(addr), 0xAA);
        }
        nes.cpu_write(0x1FFF, 0x55);
        assert_eq!(nes.debug_read(0x07FF), 0x55);
    }

    #[test]
    fn controller_reports_buttons_in_serial_order() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller_state(BUTTON_A | BUTTON_START | BUTTON_RIGHT);
        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);

        let expected = [1, 0, 0, 1, 0, 0, 0, 1];
        for bit in expected {
            assert_eq!(nes.cpu_read(0x4016), bit);
        }
        // Exhausted reads return 0 until the 8-bit index wraps around.
        for _ in 8..256 {
            assert_eq!(nes.cpu_read(0x4016), 0);
        }
        assert_eq!(nes.cpu_read(0x4016), 1);
    }

    #[test]
    fn strobe_held_high_replays_the_first_button() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller_state(BUTTON_A);
        nes.cpu_write(0x4016, 1);
        for _ in 0..3 {
            assert_eq!(nes.cpu_read(0x4016), 1);
        }
    }

    #[test]
    fn second_controller_shares_the_strobe_line() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller2_state(BUTTON_B);
        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);
        assert_eq!(nes.cpu_read(0x4017), 0);
        assert_eq!(nes.cpu_read(0x4017), 1);
        assert_eq!(nes.cpu_read(0x4017), 0);
    }

    #[test]
    fn debug_read_does_not_disturb_the_controller_index() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller_state(BUTTON_A);
        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);
        for _ in 0..4 {
            assert_eq!(nes.debug_read(0x4016), 0);
        }
        assert_eq!(nes.cpu_read(0x4016), 1);
    }

    #[test]
    fn oam_dma_copies_a_page_with_even_parity_stall() {
        let mut nes = nes_with_program(&[0xA9, 0x02, 0x8D, 0x14, 0x40]);
        for i in 0..256u16 {
            nes.cpu_write(0x0200 + i, i as u8);
        }

        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.step_instruction(), 4);
        assert_eq!(nes.dma_cycles, 513);
        assert_eq!(nes.debug_peek_oam(0), 0);
        assert_eq!(nes.debug_peek_oam(128), 128);
        assert_eq!(nes.debug_peek_oam(255), 255);

        // Stall consumes one cycle per step.
        assert_eq!(nes.step_instruction(), 1);
        assert_eq!(nes.dma_cycles, 512);
    }

    #[test]
    fn oam_dma_takes_an_extra_cycle_on_odd_parity() {
        let mut nes = nes_with_program(&[0xA5, 0x10, 0xA9, 0x02, 0x8D, 0x14, 0x40]);
        assert_eq!(nes.step_instruction(), 3);
        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.step_instruction(), 4);
        assert_eq!(nes.dma_cycles, 514);
    }

    #[test]
    fn run_frame_advances_the_frame_counter_once() {
        let mut nes = nes_with_program(&[0x4C, 0x00, 0x80]);
        assert_eq!(nes.frame_count(), 0);
        nes.run_frame();
        assert_eq!(nes.frame_count(), 1);

        let cycles = nes.run_frame();
        assert_eq!(nes.frame_count(), 2);
        // 89342 dots at three per CPU cycle, give or take one instruction.
        assert!((29_700..=29_900).contains(&cycles), "cycles = {cycles}");
    }

    #[test]
    fn run_cycles_meets_the_budget_within_one_instruction() {
        let mut nes = nes_with_program(&[0x4C, 0x00, 0x80]);
        let consumed = nes.run_cycles(1_000);
        assert!(consumed >= 1_000);
        assert!(consumed < 1_000 + 8);
        assert_eq!(nes.debug_total_cycles(), u64::from(consumed));
    }

    #[test]
    fn unmapped_cartridge_reads_record_a_debug_event() {
        let mut nes = nes_with_program(&[]);
        assert_eq!(nes.cpu_read(0x6000), 0);
        let events = nes.debug_recent_events(4);
        assert!(events.iter().any(|e| e.contains("ignored read")), "{events:?}");
    }

    #[test]
    fn io_holes_read_as_zero_without_events() {
        let mut nes = nes_with_program(&[]);
        assert_eq!(nes.cpu_read(0x5000), 0);
        assert_eq!(nes.cpu_read(0x4000), 0);
        let events = nes.debug_recent_events(16);
        assert!(!events.iter().any(|e| e.contains("ignored")));
    }

    #[test]
    fn insert_cartridge_reports_the_mapper() {
        let nes = nes_with_program(&[]);
        assert!(nes.has_rom());
        assert_eq!(nes.mapper_name(), "NROM (mapper 0)");
        let events = nes.debug_recent_events(8);
        assert!(events.iter().any(|e| e.contains("ROM loaded")));
        assert!(events.iter().any(|e| e.contains("CPU reset")));
    }

    #[test]
    fn stepping_without_a_cartridge_is_a_no_op() {
        let mut nes = Nes::new();
        assert_eq!(nes.step_instruction(), 0);
        assert_eq!(nes.run_frame(), 0);
        assert_eq!(nes.run_cycles(100), 0);
        assert_eq!(nes.frame_buffer().len(), FRAME_WIDTH * FRAME_HEIGHT * 4);
        assert_eq!(nes.debug_read(0x8000), 0);
    }
}
