use super::mapper::{Mapper, Mirroring};
use super::palette::NES_PALETTE;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

// Ticks between the NMI line rising and the CPU observing it. A game that
// turns the vblank flag off again inside this window cancels the interrupt.
const NMI_DELAY_TICKS: u8 = 15;

pub struct Ppu {
    cycle: u16,
    scanline: u16,
    frame: u64,
    odd_frame: bool,

    ctrl: u8,
    mask: u8,
    status: u8,
    register_latch: u8,
    oam_addr: u8,

    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,

    nmi_previous: bool,
    nmi_delay: u8,
    nmi_signal: bool,

    nametable_byte: u8,
    attribute_byte: u8,
    pattern_low: u8,
    pattern_high: u8,
    tile_shift: u64,

    sprite_count: usize,
    sprite_patterns: [u32; 8],
    sprite_positions: [u8; 8],
    sprite_priorities: [u8; 8],
    sprite_indexes: [u8; 8],

    vram: [u8; 2048],
    palette_ram: [u8; 32],
    oam: [u8; 256],

    front: Vec<u8>,
    back: Vec<u8>,
}

impl Ppu {
    pub fn new() -> Self {
        let mut ppu = Ppu {
            cycle: 0,
            scanline: 0,
            frame: 0,
            odd_frame: false,
            ctrl: 0,
            mask: 0,
            status: 0,
            register_latch: 0,
            oam_addr: 0,
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            nmi_previous: false,
            nmi_delay: 0,
            nmi_signal: false,
            nametable_byte: 0,
            attribute_byte: 0,
            pattern_low: 0,
            pattern_high: 0,
            tile_shift: 0,
            sprite_count: 0,
            sprite_patterns: [0; 8],
            sprite_positions: [0; 8],
            sprite_priorities: [0; 8],
            sprite_indexes: [0; 8],
            vram: [0; 2048],
            palette_ram: [0; 32],
            oam: [0; 256],
            front: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4],
            back: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4],
        };
        ppu.reset();
        ppu
    }

    // Restarts late in the post-render region so the first vblank arrives
    // almost immediately.
    pub fn reset(&mut self) {
        self.cycle = 340;
        self.scanline = 240;
        self.frame = 0;
        self.write_control(0);
        self.mask = 0;
        self.oam_addr = 0;
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.front
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn take_nmi(&mut self) -> bool {
        let signal = self.nmi_signal;
        self.nmi_signal = false;
        signal
    }

    pub fn debug_timing(&self) -> (u64, u16, u16) {
        (self.frame, self.scanline, self.cycle)
    }

    pub fn debug_peek_vram(&self, index: usize) -> u8 {
        self.vram[index % self.vram.len()]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index % self.palette_ram.len()]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index % self.oam.len()]
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        match addr {
            0x2002 => self.read_status(),
            0x2004 => self.read_oam_data(),
            0x2007 => self.read_data(mapper),
            _ => 0,
        }
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        // Every write refreshes the latch that backs the low status bits.
        self.register_latch = value;
        match addr {
            0x2000 => self.write_control(value),
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => self.write_oam_data(value),
            0x2005 => self.write_scroll(value),
            0x2006 => self.write_addr(value),
            0x2007 => self.write_data(value, mapper),
            _ => {}
        }
    }

    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        for &byte in bytes {
            self.oam[self.oam_addr as usize] = byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    fn read_status(&mut self) -> u8 {
        let value = (self.register_latch & 0x1F) | (self.status & 0xE0);
        self.status &= !STATUS_VBLANK;
        self.update_nmi_line();
        self.write_toggle = false;
        value
    }

    fn read_oam_data(&self) -> u8 {
        let data = self.oam[self.oam_addr as usize];
        // Attribute bytes have no storage for bits 2-4.
        if self.oam_addr & 0x03 == 0x02 { data & 0xE3 } else { data }
    }

    fn read_data(&mut self, mapper: &mut dyn Mapper) -> u8 {
        let mut value = self.ppu_read(self.v, mapper);
        if self.v % 0x4000 < 0x3F00 {
            // Nametable and pattern reads go through a one-read delay buffer.
            let buffered = self.read_buffer;
            self.read_buffer = value;
            value = buffered;
        } else {
            // Palette reads are immediate but refill the buffer from the
            // nametable underneath.
            self.read_buffer = self.ppu_read(self.v.wrapping_sub(0x1000), mapper);
        }
        self.increment_vram_addr();
        value
    }

    fn write_control(&mut self, value: u8) {
        self.ctrl = value;
        self.t = (self.t & 0xF3FF) | ((u16::from(value) & 0x03) << 10);
        self.update_nmi_line();
    }

    fn write_oam_data(&mut self, value: u8) {
        self.oam[self.oam_addr as usize] = value;
        self.oam_addr = self.oam_addr.wrapping_add(1);
    }

    fn write_scroll(&mut self, value: u8) {
        if !self.write_toggle {
            self.t = (self.t & 0xFFE0) | (u16::from(value) >> 3);
            self.fine_x = value & 0x07;
            self.write_toggle = true;
        } else {
            self.t = (self.t & 0x8FFF) | ((u16::from(value) & 0x07) << 12);
            self.t = (self.t & 0xFC1F) | ((u16::from(value) & 0xF8) << 2);
            self.write_toggle = false;
        }
    }

    fn write_addr(&mut self, value: u8) {
        if !self.write_toggle {
            self.t = (self.t & 0x80FF) | ((u16::from(value) & 0x3F) << 8);
            self.write_toggle = true;
        } else {
            self.t = (self.t & 0xFF00) | u16::from(value);
            self.v = self.t;
            self.write_toggle = false;
        }
    }

    fn write_data(&mut self, value: u8, mapper: &mut dyn Mapper) {
        self.ppu_write(self.v, value, mapper);
        self.increment_vram_addr();
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl & CTRL_VRAM_INC_32 != 0 { 32 } else { 1 };
        self.v = self.v.wrapping_add(step);
    }

    fn rendering_enabled(&self) -> bool {
        self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES) != 0
    }

    fn update_nmi_line(&mut self) {
        let line = self.ctrl & CTRL_NMI_ENABLE != 0 && self.status & STATUS_VBLANK != 0;
        if line && !self.nmi_previous {
            self.nmi_delay = NMI_DELAY_TICKS;
        }
        self.nmi_previous = line;
    }

    pub fn tick(&mut self, mapper: &mut dyn Mapper) {
        if self.nmi_delay > 0 {
            self.nmi_delay -= 1;
            // The flag pair is re-checked when the countdown lands, so a
            // status read or control write inside the window cancels it.
            if self.nmi_delay == 0
                && self.ctrl & CTRL_NMI_ENABLE != 0
                && self.status & STATUS_VBLANK != 0
            {
                self.nmi_signal = true;
            }
        }

        self.advance_dot();

        let rendering = self.rendering_enabled();
        let pre_line = self.scanline == 261;
        let visible_line = self.scanline < 240;
        let render_line = pre_line || visible_line;
        let prefetch_cycle = (321..=336).contains(&self.cycle);
        let visible_cycle = (1..=256).contains(&self.cycle);
        let fetch_cycle = prefetch_cycle || visible_cycle;

        if rendering {
            if visible_line && visible_cycle {
                self.render_pixel();
            }
            if render_line && fetch_cycle {
                self.tile_shift <<= 4;
                match self.cycle % 8 {
                    1 => self.fetch_nametable_byte(mapper),
                    3 => self.fetch_attribute_byte(mapper),
                    5 => self.fetch_pattern_low(mapper),
                    7 => self.fetch_pattern_high(mapper),
                    0 => self.store_tile_data(),
                    _ => {}
                }
            }
            if pre_line && (280..=304).contains(&self.cycle) {
                self.copy_vertical_bits();
            }
            if render_line {
                if fetch_cycle && self.cycle % 8 == 0 {
                    self.increment_coarse_x();
                }
                if self.cycle == 256 {
                    self.increment_y();
                }
                if self.cycle == 257 {
                    self.copy_horizontal_bits();
                }
            }
            if self.cycle == 257 {
                if visible_line {
                    self.evaluate_sprites(mapper);
                } else {
                    self.sprite_count = 0;
                }
            }
        }

        if self.scanline == 241 && self.cycle == 1 {
            self.start_vblank();
        }
        if pre_line && self.cycle == 1 {
            self.clear_vblank();
            self.status &= !(STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
        }
    }

    fn advance_dot(&mut self) {
        // NTSC drops one dot from the pre-render line on alternate frames
        // while rendering is enabled.
        if self.rendering_enabled() && self.odd_frame && self.scanline == 261 && self.cycle == 339 {
            self.cycle = 0;
            self.scanline = 0;
            self.frame += 1;
            self.odd_frame = !self.odd_frame;
            return;
        }
        self.cycle += 1;
        if self.cycle > 340 {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline > 261 {
                self.scanline = 0;
                self.frame += 1;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn start_vblank(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
        self.status |= STATUS_VBLANK;
        self.update_nmi_line();
    }

    fn clear_vblank(&mut self) {
        self.status &= !STATUS_VBLANK;
        self.update_nmi_line();
    }

    fn fetch_nametable_byte(&mut self, mapper: &mut dyn Mapper) {
        let addr = 0x2000 | (self.v & 0x0FFF);
        self.nametable_byte = self.ppu_read(addr, mapper);
    }

    fn fetch_attribute_byte(&mut self, mapper: &mut dyn Mapper) {
        let v = self.v;
        let addr = 0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
        let shift = ((v >> 4) & 4) | (v & 2);
        // Stored pre-shifted so tile assembly only ORs pattern bits in.
        self.attribute_byte = ((self.ppu_read(addr, mapper) >> shift) & 3) << 2;
    }

    fn fetch_pattern_low(&mut self, mapper: &mut dyn Mapper) {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if self.ctrl & CTRL_BG_TABLE != 0 { 0x1000 } else { 0x0000 };
        let addr = table + u16::from(self.nametable_byte) * 16 + fine_y;
        self.pattern_low = self.ppu_read(addr, mapper);
    }

    fn fetch_pattern_high(&mut self, mapper: &mut dyn Mapper) {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if self.ctrl & CTRL_BG_TABLE != 0 { 0x1000 } else { 0x0000 };
        let addr = table + u16::from(self.nametable_byte) * 16 + fine_y + 8;
        self.pattern_high = self.ppu_read(addr, mapper);
    }

    fn store_tile_data(&mut self) {
        let mut data: u32 = 0;
        for _ in 0..8 {
            let p1 = (self.pattern_low & 0x80) >> 7;
            let p2 = (self.pattern_high & 0x80) >> 6;
            self.pattern_low <<= 1;
            self.pattern_high <<= 1;
            data = (data << 4) | u32::from(self.attribute_byte | p1 | p2);
        }
        self.tile_shift |= u64::from(data);
    }

    fn increment_coarse_x(&mut self) {
        if self.v & 0x001F == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if self.v & 0x7000 != 0x7000 {
            self.v += 0x1000;
        } else {
            self.v &= !0x7000;
            let mut y = (self.v & 0x03E0) >> 5;
            if y == 29 {
                y = 0;
                self.v ^= 0x0800;
            } else if y == 31 {
                // Rows 30 and 31 hold attribute data and never carry.
                y = 0;
            } else {
                y += 1;
            }
            self.v = (self.v & !0x03E0) | (y << 5);
        }
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & 0xFBE0) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & 0x841F) | (self.t & 0x7BE0);
    }

    fn render_pixel(&mut self) {
        let x = (self.cycle - 1) as usize;
        let y = self.scanline as usize;

        let mut background = self.background_pixel();
        let (index, mut sprite) = self.sprite_pixel();
        if x < 8 && self.mask & MASK_SHOW_BG_LEFT == 0 {
            background = 0;
        }
        if x < 8 && self.mask & MASK_SHOW_SPRITE_LEFT == 0 {
            sprite = 0;
        }

        let bg_opaque = background % 4 != 0;
        let sprite_opaque = sprite % 4 != 0;
        let color = if !bg_opaque && !sprite_opaque {
            0
        } else if !bg_opaque {
            sprite | 0x10
        } else if !sprite_opaque {
            background
        } else {
            if self.sprite_indexes[index] == 0 && x < 255 {
                self.status |= STATUS_SPRITE_ZERO_HIT;
            }
            if self.sprite_priorities[index] == 0 { sprite | 0x10 } else { background }
        };

        let rgb = NES_PALETTE[(self.read_palette(u16::from(color)) % 64) as usize];
        let offset = (y * FRAME_WIDTH + x) * 4;
        self.back[offset] = rgb[0];
        self.back[offset + 1] = rgb[1];
        self.back[offset + 2] = rgb[2];
        self.back[offset + 3] = 0xFF;
    }

    fn background_pixel(&self) -> u8 {
        if self.mask & MASK_SHOW_BG == 0 {
            return 0;
        }
        let data = ((self.tile_shift >> 32) as u32) >> ((7 - u32::from(self.fine_x)) * 4);
        (data & 0x0F) as u8
    }

    fn sprite_pixel(&self) -> (usize, u8) {
        if self.mask & MASK_SHOW_SPRITES == 0 {
            return (0, 0);
        }
        for i in 0..self.sprite_count {
            let mut offset = (self.cycle as i16 - 1) - i16::from(self.sprite_positions[i]);
            if !(0..=7).contains(&offset) {
                continue;
            }
            offset = 7 - offset;
            let color = ((self.sprite_patterns[i] >> (offset * 4)) & 0x0F) as u8;
            if color % 4 == 0 {
                continue;
            }
            return (i, color);
        }
        (0, 0)
    }

    // Sprites matched on line N are drawn on line N+1, so a sprite's
    // on-screen top is its OAM Y plus one.
    fn evaluate_sprites(&mut self, mapper: &mut dyn Mapper) {
        let height: i32 = if self.ctrl & CTRL_SPRITE_SIZE_16 != 0 { 16 } else { 8 };
        let mut count = 0;
        for i in 0..64 {
            let y = self.oam[i * 4];
            let attributes = self.oam[i * 4 + 2];
            let x = self.oam[i * 4 + 3];
            let row = i32::from(self.scanline) - i32::from(y);
            if row < 0 || row >= height {
                continue;
            }
            if count < 8 {
                self.sprite_patterns[count] = self.fetch_sprite_pattern(i, row as u16, mapper);
                self.sprite_positions[count] = x;
                self.sprite_priorities[count] = (attributes >> 5) & 1;
                self.sprite_indexes[count] = i as u8;
            }
            count += 1;
        }
        if count > 8 {
            count = 8;
            self.status |= STATUS_SPRITE_OVERFLOW;
        }
        self.sprite_count = count;
    }

    fn fetch_sprite_pattern(&mut self, index: usize, mut row: u16, mapper: &mut dyn Mapper) -> u32 {
        let mut tile = u16::from(self.oam[index * 4 + 1]);
        let attributes = self.oam[index * 4 + 2];
        let addr = if self.ctrl & CTRL_SPRITE_SIZE_16 == 0 {
            if attributes & 0x80 != 0 {
                row = 7 - row;
            }
            let table = if self.ctrl & CTRL_SPRITE_TABLE != 0 { 0x1000 } else { 0x0000 };
            table + tile * 16 + row
        } else {
            if attributes & 0x80 != 0 {
                row = 15 - row;
            }
            let table = (tile & 1) * 0x1000;
            tile &= 0xFE;
            if row > 7 {
                tile += 1;
                row -= 8;
            }
            table + tile * 16 + row
        };
        let palette_bits = (attributes & 3) << 2;
        let mut low = self.ppu_read(addr, mapper);
        let mut high = self.ppu_read(addr + 8, mapper);
        let mut data: u32 = 0;
        for _ in 0..8 {
            let (p1, p2);
            if attributes & 0x40 != 0 {
                p1 = low & 1;
                p2 = (high & 1) << 1;
                low >>= 1;
                high >>= 1;
            } else {
                p1 = (low & 0x80) >> 7;
                p2 = (high & 0x80) >> 6;
                low <<= 1;
                high <<= 1;
            }
            data = (data << 4) | u32::from(palette_bits | p1 | p2);
        }
        data
    }

    fn ppu_read(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.read(addr),
            0x2000..=0x3EFF => {
                let index = self.mirrored_vram_index(addr, mapper.mirroring());
                self.vram[index]
            }
            _ => self.read_palette(addr % 32),
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.write(addr, value),
            0x2000..=0x3EFF => {
                let index = self.mirrored_vram_index(addr, mapper.mirroring());
                self.vram[index] = value;
            }
            _ => self.write_palette(addr % 32, value),
        }
    }

    // Entry 0 of each sprite palette aliases the background entry.
    fn read_palette(&self, addr: u16) -> u8 {
        let mut index = addr as usize;
        if index >= 16 && index % 4 == 0 {
            index -= 16;
        }
        self.palette_ram[index]
    }

    fn write_palette(&mut self, addr: u16, value: u8) {
        let mut index = addr as usize;
        if index >= 16 && index % 4 == 0 {
            index -= 16;
        }
        self.palette_ram[index] = value;
    }

    fn mirrored_vram_index(&self, addr: u16, mirroring: Mirroring) -> usize {
        let index = ((addr - 0x2000) % 0x1000) as usize;
        let table = index / 0x400;
        let offset = index % 0x400;

        let mapped_table = match mirroring {
            Mirroring::Horizontal => match table {
                0 | 1 => 0,
                _ => 1,
            },
            Mirroring::Vertical => table & 1,
            Mirroring::OneScreenLower => 0,
            Mirroring::OneScreenUpper => 1,
        };

        mapped_table * 0x400 + offset
    }
}
