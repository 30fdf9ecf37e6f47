use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO, Interrupt, Nes,
};

// The thirteen 6502 addressing modes, named by their disassembly tags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrMode {
    Abs,
    Abx,
    Aby,
    Acc,
    Imm,
    Imp,
    Izx,
    Ind,
    Izy,
    Rel,
    Zp0,
    Zpx,
    Zpy,
}

use AddrMode::{Abs, Abx, Aby, Acc, Imm, Imp, Ind, Izx, Izy, Rel, Zp0, Zpx, Zpy};

// Resolved operand context handed to an instruction handler. pc is the
// program counter after the operand bytes, which is what branch timing and
// return-address pushes want.
pub(crate) struct StepInfo {
    addr: u16,
    pc: u16,
    mode: AddrMode,
}

#[derive(Clone, Copy)]
struct Opcode {
    name: &'static str,
    mode: AddrMode,
    size: u8,
    cycles: u8,
    page_cycles: u8,
    exec: fn(&mut Nes, &StepInfo),
}

const fn op(
    name: &'static str,
    mode: AddrMode,
    size: u8,
    cycles: u8,
    page_cycles: u8,
    exec: fn(&mut Nes, &StepInfo),
) -> Opcode {
    Opcode { name, mode, size, cycles, page_cycles, exec }
}

// One descriptor per raw opcode byte. Unofficial opcodes decode as NOPs with
// their real timings; rows with size 0 leave the PC in place.
static OPCODES: [Opcode; 256] = [
    // 0x00
    op("BRK", Imp, 2, 7, 0, Nes::brk),
    op("ORA", Izx, 2, 6, 0, Nes::ora),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("NOP", Zp0, 2, 3, 0, Nes::nop),
    op("ORA", Zp0, 2, 3, 0, Nes::ora),
    op("ASL", Zp0, 2, 5, 0, Nes::asl),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("PHP", Imp, 1, 3, 0, Nes::php),
    op("ORA", Imm, 2, 2, 0, Nes::ora),
    op("ASL", Acc, 1, 2, 0, Nes::asl),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("NOP", Abs, 3, 4, 0, Nes::nop),
    op("ORA", Abs, 3, 4, 0, Nes::ora),
    op("ASL", Abs, 3, 6, 0, Nes::asl),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0x10
    op("BPL", Rel, 2, 2, 1, Nes::bpl),
    op("ORA", Izy, 2, 5, 1, Nes::ora),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("ORA", Zpx, 2, 4, 0, Nes::ora),
    op("ASL", Zpx, 2, 6, 0, Nes::asl),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("CLC", Imp, 1, 2, 0, Nes::clc),
    op("ORA", Aby, 3, 4, 1, Nes::ora),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("ORA", Abx, 3, 4, 1, Nes::ora),
    op("ASL", Abx, 3, 7, 0, Nes::asl),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
    // 0x20
    op("JSR", Abs, 3, 6, 0, Nes::jsr),
    op("AND", Izx, 2, 6, 0, Nes::and),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("BIT", Zp0, 2, 3, 0, Nes::bit),
    op("AND", Zp0, 2, 3, 0, Nes::and),
    op("ROL", Zp0, 2, 5, 0, Nes::rol),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("PLP", Imp, 1, 4, 0, Nes::plp),
    op("AND", Imm, 2, 2, 0, Nes::and),
    op("ROL", Acc, 1, 2, 0, Nes::rol),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("BIT", Abs, 3, 4, 0, Nes::bit),
    op("AND", Abs, 3, 4, 0, Nes::and),
    op("ROL", Abs, 3, 6, 0, Nes::rol),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0x30
    op("BMI", Rel, 2, 2, 1, Nes::bmi),
    op("AND", Izy, 2, 5, 1, Nes::and),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("AND", Zpx, 2, 4, 0, Nes::and),
    op("ROL", Zpx, 2, 6, 0, Nes::rol),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("SEC", Imp, 1, 2, 0, Nes::sec),
    op("AND", Aby, 3, 4, 1, Nes::and),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("AND", Abx, 3, 4, 1, Nes::and),
    op("ROL", Abx, 3, 7, 0, Nes::rol),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
    // 0x40
    op("RTI", Imp, 1, 6, 0, Nes::rti),
    op("EOR", Izx, 2, 6, 0, Nes::eor),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("NOP", Zp0, 2, 3, 0, Nes::nop),
    op("EOR", Zp0, 2, 3, 0, Nes::eor),
    op("LSR", Zp0, 2, 5, 0, Nes::lsr),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("PHA", Imp, 1, 3, 0, Nes::pha),
    op("EOR", Imm, 2, 2, 0, Nes::eor),
    op("LSR", Acc, 1, 2, 0, Nes::lsr),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("JMP", Abs, 3, 3, 0, Nes::jmp),
    op("EOR", Abs, 3, 4, 0, Nes::eor),
    op("LSR", Abs, 3, 6, 0, Nes::lsr),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0x50
    op("BVC", Rel, 2, 2, 1, Nes::bvc),
    op("EOR", Izy, 2, 5, 1, Nes::eor),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("EOR", Zpx, 2, 4, 0, Nes::eor),
    op("LSR", Zpx, 2, 6, 0, Nes::lsr),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("CLI", Imp, 1, 2, 0, Nes::cli),
    op("EOR", Aby, 3, 4, 1, Nes::eor),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("EOR", Abx, 3, 4, 1, Nes::eor),
    op("LSR", Abx, 3, 7, 0, Nes::lsr),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
    // 0x60
    op("RTS", Imp, 1, 6, 0, Nes::rts),
    op("ADC", Izx, 2, 6, 0, Nes::adc),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("NOP", Zp0, 2, 3, 0, Nes::nop),
    op("ADC", Zp0, 2, 3, 0, Nes::adc),
    op("ROR", Zp0, 2, 5, 0, Nes::ror),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("PLA", Imp, 1, 4, 0, Nes::pla),
    op("ADC", Imm, 2, 2, 0, Nes::adc),
    op("ROR", Acc, 1, 2, 0, Nes::ror),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("JMP", Ind, 3, 5, 0, Nes::jmp),
    op("ADC", Abs, 3, 4, 0, Nes::adc),
    op("ROR", Abs, 3, 6, 0, Nes::ror),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0x70
    op("BVS", Rel, 2, 2, 1, Nes::bvs),
    op("ADC", Izy, 2, 5, 1, Nes::adc),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("ADC", Zpx, 2, 4, 0, Nes::adc),
    op("ROR", Zpx, 2, 6, 0, Nes::ror),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("SEI", Imp, 1, 2, 0, Nes::sei),
    op("ADC", Aby, 3, 4, 1, Nes::adc),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("ADC", Abx, 3, 4, 1, Nes::adc),
    op("ROR", Abx, 3, 7, 0, Nes::ror),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
    // 0x80
    op("NOP", Imm, 2, 2, 0, Nes::nop),
    op("STA", Izx, 2, 6, 0, Nes::sta),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 6, 0, Nes::nop),
    op("STY", Zp0, 2, 3, 0, Nes::sty),
    op("STA", Zp0, 2, 3, 0, Nes::sta),
    op("STX", Zp0, 2, 3, 0, Nes::stx),
    op("NOP", Zp0, 0, 3, 0, Nes::nop),
    op("DEY", Imp, 1, 2, 0, Nes::dey),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("TXA", Imp, 1, 2, 0, Nes::txa),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("STY", Abs, 3, 4, 0, Nes::sty),
    op("STA", Abs, 3, 4, 0, Nes::sta),
    op("STX", Abs, 3, 4, 0, Nes::stx),
    op("NOP", Abs, 0, 4, 0, Nes::nop),
    // 0x90
    op("BCC", Rel, 2, 2, 1, Nes::bcc),
    op("STA", Izy, 2, 6, 0, Nes::sta),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 6, 0, Nes::nop),
    op("STY", Zpx, 2, 4, 0, Nes::sty),
    op("STA", Zpx, 2, 4, 0, Nes::sta),
    op("STX", Zpy, 2, 4, 0, Nes::stx),
    op("NOP", Zpy, 0, 4, 0, Nes::nop),
    op("TYA", Imp, 1, 2, 0, Nes::tya),
    op("STA", Aby, 3, 5, 0, Nes::sta),
    op("TXS", Imp, 1, 2, 0, Nes::txs),
    op("NOP", Aby, 0, 5, 0, Nes::nop),
    op("NOP", Abx, 0, 5, 0, Nes::nop),
    op("STA", Abx, 3, 5, 0, Nes::sta),
    op("NOP", Aby, 0, 5, 0, Nes::nop),
    op("NOP", Aby, 0, 5, 0, Nes::nop),
    // 0xA0
    op("LDY", Imm, 2, 2, 0, Nes::ldy),
    op("LDA", Izx, 2, 6, 0, Nes::lda),
    op("LDX", Imm, 2, 2, 0, Nes::ldx),
    op("NOP", Izx, 0, 6, 0, Nes::nop),
    op("LDY", Zp0, 2, 3, 0, Nes::ldy),
    op("LDA", Zp0, 2, 3, 0, Nes::lda),
    op("LDX", Zp0, 2, 3, 0, Nes::ldx),
    op("NOP", Zp0, 0, 3, 0, Nes::nop),
    op("TAY", Imp, 1, 2, 0, Nes::tay),
    op("LDA", Imm, 2, 2, 0, Nes::lda),
    op("TAX", Imp, 1, 2, 0, Nes::tax),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("LDY", Abs, 3, 4, 0, Nes::ldy),
    op("LDA", Abs, 3, 4, 0, Nes::lda),
    op("LDX", Abs, 3, 4, 0, Nes::ldx),
    op("NOP", Abs, 0, 4, 0, Nes::nop),
    // 0xB0
    op("BCS", Rel, 2, 2, 1, Nes::bcs),
    op("LDA", Izy, 2, 5, 1, Nes::lda),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 5, 1, Nes::nop),
    op("LDY", Zpx, 2, 4, 0, Nes::ldy),
    op("LDA", Zpx, 2, 4, 0, Nes::lda),
    op("LDX", Zpy, 2, 4, 0, Nes::ldx),
    op("NOP", Zpy, 0, 4, 0, Nes::nop),
    op("CLV", Imp, 1, 2, 0, Nes::clv),
    op("LDA", Aby, 3, 4, 1, Nes::lda),
    op("TSX", Imp, 1, 2, 0, Nes::tsx),
    op("NOP", Aby, 0, 4, 1, Nes::nop),
    op("LDY", Abx, 3, 4, 1, Nes::ldy),
    op("LDA", Abx, 3, 4, 1, Nes::lda),
    op("LDX", Aby, 3, 4, 1, Nes::ldx),
    op("NOP", Aby, 0, 4, 1, Nes::nop),
    // 0xC0
    op("CPY", Imm, 2, 2, 0, Nes::cpy),
    op("CMP", Izx, 2, 6, 0, Nes::cmp),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("CPY", Zp0, 2, 3, 0, Nes::cpy),
    op("CMP", Zp0, 2, 3, 0, Nes::cmp),
    op("DEC", Zp0, 2, 5, 0, Nes::dec),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("INY", Imp, 1, 2, 0, Nes::iny),
    op("CMP", Imm, 2, 2, 0, Nes::cmp),
    op("DEX", Imp, 1, 2, 0, Nes::dex),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("CPY", Abs, 3, 4, 0, Nes::cpy),
    op("CMP", Abs, 3, 4, 0, Nes::cmp),
    op("DEC", Abs, 3, 6, 0, Nes::dec),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0xD0
    op("BNE", Rel, 2, 2, 1, Nes::bne),
    op("CMP", Izy, 2, 5, 1, Nes::cmp),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("CMP", Zpx, 2, 4, 0, Nes::cmp),
    op("DEC", Zpx, 2, 6, 0, Nes::dec),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("CLD", Imp, 1, 2, 0, Nes::cld),
    op("CMP", Aby, 3, 4, 1, Nes::cmp),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("CMP", Abx, 3, 4, 1, Nes::cmp),
    op("DEC", Abx, 3, 7, 0, Nes::dec),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
    // 0xE0
    op("CPX", Imm, 2, 2, 0, Nes::cpx),
    op("SBC", Izx, 2, 6, 0, Nes::sbc),
    op("NOP", Imm, 0, 2, 0, Nes::nop),
    op("NOP", Izx, 0, 8, 0, Nes::nop),
    op("CPX", Zp0, 2, 3, 0, Nes::cpx),
    op("SBC", Zp0, 2, 3, 0, Nes::sbc),
    op("INC", Zp0, 2, 5, 0, Nes::inc),
    op("NOP", Zp0, 0, 5, 0, Nes::nop),
    op("INX", Imp, 1, 2, 0, Nes::inx),
    op("SBC", Imm, 2, 2, 0, Nes::sbc),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("SBC", Imm, 0, 2, 0, Nes::sbc),
    op("CPX", Abs, 3, 4, 0, Nes::cpx),
    op("SBC", Abs, 3, 4, 0, Nes::sbc),
    op("INC", Abs, 3, 6, 0, Nes::inc),
    op("NOP", Abs, 0, 6, 0, Nes::nop),
    // 0xF0
    op("BEQ", Rel, 2, 2, 1, Nes::beq),
    op("SBC", Izy, 2, 5, 1, Nes::sbc),
    op("NOP", Imp, 0, 2, 0, Nes::nop),
    op("NOP", Izy, 0, 8, 0, Nes::nop),
    op("NOP", Zpx, 2, 4, 0, Nes::nop),
    op("SBC", Zpx, 2, 4, 0, Nes::sbc),
    op("INC", Zpx, 2, 6, 0, Nes::inc),
    op("NOP", Zpx, 0, 6, 0, Nes::nop),
    op("SED", Imp, 1, 2, 0, Nes::sed),
    op("SBC", Aby, 3, 4, 1, Nes::sbc),
    op("NOP", Imp, 1, 2, 0, Nes::nop),
    op("NOP", Aby, 0, 7, 0, Nes::nop),
    op("NOP", Abx, 3, 4, 1, Nes::nop),
    op("SBC", Abx, 3, 4, 1, Nes::sbc),
    op("INC", Abx, 3, 7, 0, Nes::inc),
    op("NOP", Abx, 0, 7, 0, Nes::nop),
];

fn pages_differ(a: u16, b: u16) -> bool {
    a & 0xFF00 != b & 0xFF00
}

impl Nes {
    // Runs one CPU step and returns the cycles it consumed. A step is one
    // stalled DMA cycle, or a pending interrupt entry followed by the first
    // instruction of its handler, or a single instruction.
    pub(crate) fn step_cpu(&mut self) -> u32 {
        if self.dma_cycles > 0 {
            self.dma_cycles -= 1;
            self.total_cycles += 1;
            return 1;
        }

        let start_cycles = self.total_cycles;
        self.instruction_count += 1;

        match self.interrupt {
            Interrupt::Nmi => self.service_nmi(),
            Interrupt::Irq => {
                if !self.get_flag(FLAG_INTERRUPT) {
                    self.service_irq();
                }
            }
            Interrupt::None => {}
        }
        self.interrupt = Interrupt::None;

        let entry = OPCODES[self.cpu_read(self.pc) as usize];
        let operand = self.pc.wrapping_add(1);

        let (addr, page_crossed) = match entry.mode {
            Abs => (self.read_u16(operand), false),
            Abx => {
                let addr = self.read_u16(operand).wrapping_add(self.x as u16);
                (addr, pages_differ(addr.wrapping_sub(self.x as u16), addr))
            }
            Aby => {
                let addr = self.read_u16(operand).wrapping_add(self.y as u16);
                (addr, pages_differ(addr.wrapping_sub(self.y as u16), addr))
            }
            Acc | Imp => (0, false),
            Imm => (operand, false),
            Izx => {
                let pointer = (self.cpu_read(operand) as u16).wrapping_add(self.x as u16);
                (self.read_u16_bug(pointer), false)
            }
            Ind => {
                let pointer = self.read_u16(operand);
                (self.read_u16_bug(pointer), false)
            }
            Izy => {
                let pointer = self.cpu_read(operand) as u16;
                let addr = self.read_u16_bug(pointer).wrapping_add(self.y as u16);
                (addr, pages_differ(addr.wrapping_sub(self.y as u16), addr))
            }
            Rel => {
                let offset = self.cpu_read(operand) as u16;
                let base = self.pc.wrapping_add(2).wrapping_add(offset);
                if offset < 0x80 {
                    (base, false)
                } else {
                    (base.wrapping_sub(0x100), false)
                }
            }
            Zp0 => (self.cpu_read(operand) as u16, false),
            Zpx => (self.cpu_read(operand).wrapping_add(self.x) as u16, false),
            Zpy => (self.cpu_read(operand).wrapping_add(self.y) as u16, false),
        };

        self.pc = self.pc.wrapping_add(entry.size as u16);
        self.total_cycles += entry.cycles as u64;
        if page_crossed {
            self.total_cycles += entry.page_cycles as u64;
        }

        let info = StepInfo { addr, pc: self.pc, mode: entry.mode };
        (entry.exec)(self, &info);

        (self.total_cycles - start_cycles) as u32
    }

    // Taken branches cost one extra cycle, two if the target sits on a
    // different page than the instruction after the branch.
    fn add_branch_cycles(&mut self, info: &StepInfo) {
        self.total_cycles += 1;
        if pages_differ(info.pc, info.addr) {
            self.total_cycles += 1;
        }
    }

    fn compare(&mut self, a: u8, b: u8) {
        self.update_zn(a.wrapping_sub(b));
        self.set_flag(FLAG_CARRY, a >= b);
    }

    fn adc(&mut self, info: &StepInfo) {
        let a = self.a;
        let b = self.cpu_read(info.addr);
        let carry = self.get_flag(FLAG_CARRY) as u8;
        self.a = a.wrapping_add(b).wrapping_add(carry);
        self.update_zn(self.a);
        self.set_flag(FLAG_CARRY, a as u16 + b as u16 + carry as u16 > 0xFF);
        self.set_flag(FLAG_OVERFLOW, (a ^ b) & 0x80 == 0 && (a ^ self.a) & 0x80 != 0);
    }

    fn sbc(&mut self, info: &StepInfo) {
        let a = self.a;
        let b = self.cpu_read(info.addr);
        let borrow = 1 - self.get_flag(FLAG_CARRY) as u8;
        self.a = a.wrapping_sub(b).wrapping_sub(borrow);
        self.update_zn(self.a);
        self.set_flag(FLAG_CARRY, a as i16 - b as i16 - borrow as i16 >= 0);
        self.set_flag(FLAG_OVERFLOW, (a ^ b) & 0x80 != 0 && (a ^ self.a) & 0x80 != 0);
    }

    fn and(&mut self, info: &StepInfo) {
        self.a &= self.cpu_read(info.addr);
        self.update_zn(self.a);
    }

    fn ora(&mut self, info: &StepInfo) {
        self.a |= self.cpu_read(info.addr);
        self.update_zn(self.a);
    }

    fn eor(&mut self, info: &StepInfo) {
        self.a ^= self.cpu_read(info.addr);
        self.update_zn(self.a);
    }

    fn bit(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr);
        self.set_flag(FLAG_OVERFLOW, value & 0x40 != 0);
        self.set_flag(FLAG_ZERO, value & self.a == 0);
        self.set_flag(FLAG_NEGATIVE, value & 0x80 != 0);
    }

    fn asl(&mut self, info: &StepInfo) {
        if info.mode == Acc {
            self.set_flag(FLAG_CARRY, self.a & 0x80 != 0);
            self.a <<= 1;
            self.update_zn(self.a);
        } else {
            let mut value = self.cpu_read(info.addr);
            self.set_flag(FLAG_CARRY, value & 0x80 != 0);
            value <<= 1;
            self.cpu_write(info.addr, value);
            self.update_zn(value);
        }
    }

    fn lsr(&mut self, info: &StepInfo) {
        if info.mode == Acc {
            self.set_flag(FLAG_CARRY, self.a & 0x01 != 0);
            self.a >>= 1;
            self.update_zn(self.a);
        } else {
            let mut value = self.cpu_read(info.addr);
            self.set_flag(FLAG_CARRY, value & 0x01 != 0);
            value >>= 1;
            self.cpu_write(info.addr, value);
            self.update_zn(value);
        }
    }

    fn rol(&mut self, info: &StepInfo) {
        let carry = self.get_flag(FLAG_CARRY) as u8;
        if info.mode == Acc {
            self.set_flag(FLAG_CARRY, self.a & 0x80 != 0);
            self.a = (self.a << 1) | carry;
            self.update_zn(self.a);
        } else {
            let mut value = self.cpu_read(info.addr);
            self.set_flag(FLAG_CARRY, value & 0x80 != 0);
            value = (value << 1) | carry;
            self.cpu_write(info.addr, value);
            self.update_zn(value);
        }
    }

    fn ror(&mut self, info: &StepInfo) {
        let carry = self.get_flag(FLAG_CARRY) as u8;
        if info.mode == Acc {
            self.set_flag(FLAG_CARRY, self.a & 0x01 != 0);
            self.a = (self.a >> 1) | (carry << 7);
            self.update_zn(self.a);
        } else {
            let mut value = self.cpu_read(info.addr);
            self.set_flag(FLAG_CARRY, value & 0x01 != 0);
            value = (value >> 1) | (carry << 7);
            self.cpu_write(info.addr, value);
            self.update_zn(value);
        }
    }

    fn bcc(&mut self, info: &StepInfo) {
        if !self.get_flag(FLAG_CARRY) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bcs(&mut self, info: &StepInfo) {
        if self.get_flag(FLAG_CARRY) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn beq(&mut self, info: &StepInfo) {
        if self.get_flag(FLAG_ZERO) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bne(&mut self, info: &StepInfo) {
        if !self.get_flag(FLAG_ZERO) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bmi(&mut self, info: &StepInfo) {
        if self.get_flag(FLAG_NEGATIVE) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bpl(&mut self, info: &StepInfo) {
        if !self.get_flag(FLAG_NEGATIVE) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bvc(&mut self, info: &StepInfo) {
        if !self.get_flag(FLAG_OVERFLOW) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn bvs(&mut self, info: &StepInfo) {
        if self.get_flag(FLAG_OVERFLOW) {
            self.pc = info.addr;
            self.add_branch_cycles(info);
        }
    }

    fn brk(&mut self, info: &StepInfo) {
        self.push_u16(self.pc);
        self.php(info);
        self.sei(info);
        self.pc = self.read_u16(0xFFFE);
    }

    fn rti(&mut self, _: &StepInfo) {
        let flags = self.pop();
        self.p = (flags & !FLAG_BREAK) | FLAG_UNUSED;
        self.pc = self.pop_u16();
    }

    fn jmp(&mut self, info: &StepInfo) {
        self.pc = info.addr;
    }

    fn jsr(&mut self, info: &StepInfo) {
        self.push_u16(self.pc.wrapping_sub(1));
        self.pc = info.addr;
    }

    fn rts(&mut self, _: &StepInfo) {
        self.pc = self.pop_u16().wrapping_add(1);
    }

    fn cmp(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr);
        self.compare(self.a, value);
    }

    fn cpx(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr);
        self.compare(self.x, value);
    }

    fn cpy(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr);
        self.compare(self.y, value);
    }

    fn dec(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr).wrapping_sub(1);
        self.cpu_write(info.addr, value);
        self.update_zn(value);
    }

    fn inc(&mut self, info: &StepInfo) {
        let value = self.cpu_read(info.addr).wrapping_add(1);
        self.cpu_write(info.addr, value);
        self.update_zn(value);
    }

    fn dex(&mut self, _: &StepInfo) {
        self.x = self.x.wrapping_sub(1);
        self.update_zn(self.x);
    }

    fn dey(&mut self, _: &StepInfo) {
        self.y = self.y.wrapping_sub(1);
        self.update_zn(self.y);
    }

    fn inx(&mut self, _: &StepInfo) {
        self.x = self.x.wrapping_add(1);
        self.update_zn(self.x);
    }

    fn iny(&mut self, _: &StepInfo) {
        self.y = self.y.wrapping_add(1);
        self.update_zn(self.y);
    }

    fn lda(&mut self, info: &StepInfo) {
        self.a = self.cpu_read(info.addr);
        self.update_zn(self.a);
    }

    fn ldx(&mut self, info: &StepInfo) {
        self.x = self.cpu_read(info.addr);
        self.update_zn(self.x);
    }

    fn ldy(&mut self, info: &StepInfo) {
        self.y = self.cpu_read(info.addr);
        self.update_zn(self.y);
    }

    fn sta(&mut self, info: &StepInfo) {
        self.cpu_write(info.addr, self.a);
    }

    fn stx(&mut self, info: &StepInfo) {
        self.cpu_write(info.addr, self.x);
    }

    fn sty(&mut self, info: &StepInfo) {
        self.cpu_write(info.addr, self.y);
    }

    fn pha(&mut self, _: &StepInfo) {
        self.push(self.a);
    }

    fn php(&mut self, _: &StepInfo) {
        self.push(self.p | FLAG_BREAK | FLAG_UNUSED);
    }

    fn pla(&mut self, _: &StepInfo) {
        self.a = self.pop();
        self.update_zn(self.a);
    }

    fn plp(&mut self, _: &StepInfo) {
        let flags = self.pop();
        self.p = (flags & !FLAG_BREAK) | FLAG_UNUSED;
    }

    fn clc(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_CARRY, false);
    }

    fn cld(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_DECIMAL, false);
    }

    fn cli(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_INTERRUPT, false);
    }

    fn clv(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_OVERFLOW, false);
    }

    fn sec(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_CARRY, true);
    }

    fn sed(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_DECIMAL, true);
    }

    fn sei(&mut self, _: &StepInfo) {
        self.set_flag(FLAG_INTERRUPT, true);
    }

    fn tax(&mut self, _: &StepInfo) {
        self.x = self.a;
        self.update_zn(self.x);
    }

    fn tay(&mut self, _: &StepInfo) {
        self.y = self.a;
        self.update_zn(self.y);
    }

    fn tsx(&mut self, _: &StepInfo) {
        self.x = self.sp;
        self.update_zn(self.x);
    }

    fn txa(&mut self, _: &StepInfo) {
        self.a = self.x;
        self.update_zn(self.a);
    }

    fn txs(&mut self, _: &StepInfo) {
        self.sp = self.x;
    }

    fn tya(&mut self, _: &StepInfo) {
        self.a = self.y;
        self.update_zn(self.a);
    }

    fn nop(&mut self, _: &StepInfo) {}

    fn debug_read_u16(&self, addr: u16) -> u16 {
        let lo = self.debug_read(addr) as u16;
        let hi = self.debug_read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    // Decodes instructions from start up to (not including) end into
    // (address, text) lines using side-effect-free reads. Operand bytes
    // are rendered symbolically; relative branches show the resolved target.
    pub fn disassemble(&self, start: u16, end: u16) -> Vec<(u16, String)> {
        let mut lines = Vec::new();
        let mut pc = start;
        while pc < end {
            let line_pc = pc;
            let entry = &OPCODES[self.debug_read(pc) as usize];
            pc = pc.wrapping_add(1);

            let operand = match entry.mode {
                Abs | Abx | Aby | Ind => {
                    let value = self.debug_read_u16(pc);
                    pc = pc.wrapping_add(2);
                    match entry.mode {
                        Abs => format!("${value:04X} {{ABS}}"),
                        Abx => format!("${value:04X},X {{ABX}}"),
                        Aby => format!("${value:04X},Y {{ABY}}"),
                        _ => format!("(${value:04X}) {{IND}}"),
                    }
                }
                Acc => "{ACC}".to_string(),
                Imp => "{IMP}".to_string(),
                Rel => {
                    let offset = self.debug_read(pc) as u16;
                    pc = pc.wrapping_add(1);
                    let base = line_pc.wrapping_add(2).wrapping_add(offset);
                    let target = if offset < 0x80 { base } else { base.wrapping_sub(0x100) };
                    format!("${target:04X} {{REL}}")
                }
                Imm | Izx | Izy | Zp0 | Zpx | Zpy => {
                    let value = self.debug_read(pc);
                    pc = pc.wrapping_add(1);
                    match entry.mode {
                        Imm => format!("#${value:02X} {{IMM}}"),
                        Izx => format!("(${value:02X},X) {{IZX}}"),
                        Izy => format!("(${value:02X}),Y {{IZY}}"),
                        Zp0 => format!("${value:02X} {{ZP0}}"),
                        Zpx => format!("${value:02X},X {{ZPX}}"),
                        _ => format!("${value:02X},Y {{ZPY}}"),
                    }
                }
            };

            lines.push((line_pc, format!("${line_pc:04X}: {} {operand}", entry.name)));
            if pc < line_pc {
                break;
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{nes_with_prg, nes_with_program, prg_with_program};
    use super::super::{
        FLAG_BREAK, FLAG_CARRY, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW, FLAG_UNUSED,
        FLAG_ZERO, Interrupt,
    };

    #[test]
    fn lda_immediate_sets_zero_and_negative() {
        let mut nes = nes_with_program(&[0xA9, 0x00, 0xA9, 0x80]);

        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.a, 0x00);
        assert!(nes.get_flag(FLAG_ZERO));
        assert!(!nes.get_flag(FLAG_NEGATIVE));

        nes.step_instruction();
        assert_eq!(nes.a, 0x80);
        assert!(!nes.get_flag(FLAG_ZERO));
        assert!(nes.get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn page_cross_adds_a_cycle_on_indexed_loads() {
        // LDX #$01; LDA $80FF,X lands on $8100, crossing a page.
        let mut nes = nes_with_program(&[0xA2, 0x01, 0xBD, 0xFF, 0x80]);
        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.step_instruction(), 5);

        // Same load without the crossing stays at the base cost.
        let mut nes = nes_with_program(&[0xA2, 0x01, 0xBD, 0x00, 0x80]);
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 4);
    }

    #[test]
    fn stores_skip_the_page_penalty() {
        // LDY #$FF; STA $8001,Y crosses into $8100 but STA has no page cost.
        let mut nes = nes_with_program(&[0xA0, 0xFF, 0x99, 0x01, 0x80]);
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 5);
    }

    #[test]
    fn branch_cycles_cover_not_taken_taken_and_page_cross() {
        let mut nes = nes_with_program(&[0xA9, 0x01, 0xF0, 0x01]);
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.pc, 0x8004);

        let mut nes = nes_with_program(&[0xA9, 0x00, 0xF0, 0x01]);
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 3);
        assert_eq!(nes.pc, 0x8005);

        // Branch at $80FD whose target $8100 sits on the next page.
        let mut prg = prg_with_program(&[0xA9, 0x00, 0x4C, 0xFD, 0x80]);
        prg[0xFD] = 0xF0;
        prg[0xFE] = 0x01;
        let mut nes = nes_with_prg(prg);
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 4);
        assert_eq!(nes.pc, 0x8100);
    }

    #[test]
    fn jmp_indirect_wraps_the_pointer_high_byte() {
        let mut nes = nes_with_program(&[0x6C, 0xFF, 0x02]);
        nes.cpu_write(0x02FF, 0x34);
        nes.cpu_write(0x0200, 0x12);
        nes.cpu_write(0x0300, 0x99);

        assert_eq!(nes.step_instruction(), 5);
        assert_eq!(nes.pc, 0x1234);
    }

    #[test]
    fn indexed_indirect_pointer_leaves_the_zero_page() {
        // LDX #$02; LDA ($FF,X): the pointer sum $0101 is used as-is rather
        // than wrapped back into the zero page.
        let mut nes = nes_with_program(&[0xA2, 0x02, 0xA1, 0xFF]);
        nes.cpu_write(0x0101, 0x40);
        nes.cpu_write(0x0102, 0x01);
        nes.cpu_write(0x0140, 0x99);
        nes.cpu_write(0x0001, 0x60);
        nes.cpu_write(0x0002, 0x01);
        nes.cpu_write(0x0160, 0x11);

        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 6);
        assert_eq!(nes.a, 0x99);
    }

    #[test]
    fn indirect_indexed_adds_y_after_the_lookup() {
        let mut prg = prg_with_program(&[0xA0, 0x01, 0xB1, 0x10]);
        prg[0x100] = 0x42;
        let mut nes = nes_with_prg(prg);
        nes.cpu_write(0x0010, 0xFF);
        nes.cpu_write(0x0011, 0x80);

        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 6);
        assert_eq!(nes.a, 0x42);
    }

    #[test]
    fn brk_pushes_state_and_jumps_through_the_irq_vector() {
        let mut prg = prg_with_program(&[0x00]);
        prg[0x3FFE] = 0x00;
        prg[0x3FFF] = 0x90;
        let mut nes = nes_with_prg(prg);

        assert_eq!(nes.step_instruction(), 7);
        assert_eq!(nes.pc, 0x9000);
        assert_eq!(nes.sp, 0xFA);
        assert_eq!(nes.ram[0x01FD], 0x80);
        assert_eq!(nes.ram[0x01FC], 0x02);
        assert_eq!(nes.ram[0x01FB], 0x34);
        assert!(nes.get_flag(FLAG_INTERRUPT));
    }

    #[test]
    fn nmi_service_prefixes_the_next_instruction() {
        let mut prg = prg_with_program(&[0xEA, 0xEA]);
        prg[0x1000] = 0xEA;
        prg[0x3FFA] = 0x00;
        prg[0x3FFB] = 0x90;
        let mut nes = nes_with_prg(prg);

        nes.request_nmi();
        assert_eq!(nes.step_instruction(), 9);
        assert_eq!(nes.pc, 0x9001);
        assert_eq!(nes.interrupt, Interrupt::None);

        let pushed = nes.ram[0x01FB];
        assert_eq!(pushed & FLAG_BREAK, 0);
        assert_ne!(pushed & FLAG_UNUSED, 0);
        assert_eq!(nes.ram[0x01FD], 0x80);
        assert_eq!(nes.ram[0x01FC], 0x00);
    }

    #[test]
    fn masked_irq_latch_clears_without_service() {
        let mut nes = nes_with_program(&[0xEA]);
        nes.interrupt = Interrupt::Irq;
        assert_eq!(nes.debug_pending_interrupt(), "IRQ");

        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.pc, 0x8001);
        assert_eq!(nes.sp, 0xFD);
        assert_eq!(nes.interrupt, Interrupt::None);
        assert_eq!(nes.debug_pending_interrupt(), "none");
    }

    #[test]
    fn irq_round_trip_returns_through_rti() {
        let mut prg = prg_with_program(&[0x58, 0xEA]);
        prg[0x1000] = 0x40;
        prg[0x3FFE] = 0x00;
        prg[0x3FFF] = 0x90;
        let mut nes = nes_with_prg(prg);

        nes.step_instruction();
        nes.request_irq();
        assert_eq!(nes.step_instruction(), 13);
        assert_eq!(nes.pc, 0x8001);
        assert_eq!(nes.sp, 0xFD);
        assert!(!nes.get_flag(FLAG_INTERRUPT));
    }

    #[test]
    fn size_zero_opcodes_hold_the_pc() {
        let mut nes = nes_with_program(&[0x02]);
        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.pc, 0x8000);

        // $EB decodes as SBC immediate with size 0.
        let mut nes = nes_with_program(&[0xEB, 0x05]);
        assert_eq!(nes.step_instruction(), 2);
        assert_eq!(nes.pc, 0x8000);
        assert_eq!(nes.a, 0xFA);
    }

    #[test]
    fn unofficial_nops_use_table_timings() {
        let mut nes = nes_with_program(&[0x04, 0x10]);
        assert_eq!(nes.step_instruction(), 3);
        assert_eq!(nes.pc, 0x8002);

        // LDX #$01; NOP $80FF,X pays the page-cross cycle.
        let mut nes = nes_with_program(&[0xA2, 0x01, 0x1C, 0xFF, 0x80]);
        nes.step_instruction();
        assert_eq!(nes.step_instruction(), 5);
        assert_eq!(nes.pc, 0x8005);
    }

    #[test]
    fn adc_and_sbc_flag_matrix() {
        let mut nes = nes_with_program(&[0xA9, 0x50, 0x69, 0x50]);
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.a, 0xA0);
        assert!(nes.get_flag(FLAG_OVERFLOW));
        assert!(!nes.get_flag(FLAG_CARRY));
        assert!(nes.get_flag(FLAG_NEGATIVE));

        let mut nes = nes_with_program(&[0xA9, 0xFF, 0x69, 0x01]);
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.a, 0x00);
        assert!(nes.get_flag(FLAG_CARRY));
        assert!(nes.get_flag(FLAG_ZERO));
        assert!(!nes.get_flag(FLAG_OVERFLOW));

        let mut nes = nes_with_program(&[0x38, 0xA9, 0x40, 0xE9, 0x10]);
        nes.step_instruction();
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.a, 0x30);
        assert!(nes.get_flag(FLAG_CARRY));

        // Carry clear borrows one.
        let mut nes = nes_with_program(&[0xA9, 0x40, 0xE9, 0x40]);
        nes.step_instruction();
        nes.step_instruction();
        assert_eq!(nes.a, 0xFF);
        assert!(!nes.get_flag(FLAG_CARRY));
        assert!(nes.get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn stack_push_wraps_within_page_one() {
        let mut nes = nes_with_program(&[0x48]);
        nes.sp = 0x00;
        nes.a = 0x77;

        assert_eq!(nes.step_instruction(), 3);
        assert_eq!(nes.ram[0x0100], 0x77);
        assert_eq!(nes.sp, 0xFF);
    }

    #[test]
    fn disassembler_renders_every_operand_form() {
        let nes = nes_with_program(&[
            0xA9, 0x10, // LDA #$10
            0xAD, 0x34, 0x12, // LDA $1234
            0xBD, 0x34, 0x12, // LDA $1234,X
            0xB9, 0x34, 0x12, // LDA $1234,Y
            0x0A, // ASL A
            0xEA, // NOP
            0xA1, 0x20, // LDA ($20,X)
            0x6C, 0xFF, 0x02, // JMP ($02FF)
            0xB1, 0x20, // LDA ($20),Y
            0xF0, 0xFE, // BEQ back onto itself
            0xA5, 0x10, // LDA $10
            0xB5, 0x10, // LDA $10,X
            0xB6, 0x10, // LDX $10,Y
        ]);

        let lines = nes.disassemble(0x8000, 0x801C);
        let expected: [(u16, &str); 13] = [
            (0x8000, "$8000: LDA #$10 {IMM}"),
            (0x8002, "$8002: LDA $1234 {ABS}"),
            (0x8005, "$8005: LDA $1234,X {ABX}"),
            (0x8008, "$8008: LDA $1234,Y {ABY}"),
            (0x800B, "$800B: ASL {ACC}"),
            (0x800C, "$800C: NOP {IMP}"),
            (0x800D, "$800D: LDA ($20,X) {IZX}"),
            (0x800F, "$800F: JMP ($02FF) {IND}"),
            (0x8012, "$8012: LDA ($20),Y {IZY}"),
            (0x8014, "$8014: BEQ $8014 {REL}"),
            (0x8016, "$8016: LDA $10 {ZP0}"),
            (0x8018, "$8018: LDA $10,X {ZPX}"),
            (0x801A, "$801A: LDX $10,Y {ZPY}"),
        ];

        assert_eq!(lines.len(), expected.len());
        for ((addr, text), (want_addr, want_text)) in lines.iter().zip(expected.iter()) {
            assert_eq!(addr, want_addr);
            assert_eq!(text, want_text);
        }
    }

    #[test]
    fn disassembler_advances_by_operand_bytes_for_size_zero_rows() {
        // $02 executes with size 0, but the listing still walks past it.
        let nes = nes_with_program(&[0x02, 0xA9, 0x05, 0xEA]);
        let lines = nes.disassemble(0x8000, 0x8004);

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], (0x8000, "$8000: NOP {IMP}".to_string()));
        assert_eq!(lines[1], (0x8001, "$8001: LDA #$05 {IMM}".to_string()));
        assert_eq!(lines[2], (0x8003, "$8003: NOP {IMP}".to_string()));
    }

    #[test]
    fn step_returns_match_total_cycle_delta() {
        let mut nes = nes_with_program(&[
            0xA9, 0x07, // LDA #$07
            0x85, 0x10, // STA $10
            0xA5, 0x10, // LDA $10
            0xC6, 0x10, // DEC $10
            0x4C, 0x00, 0x80, // JMP $8000
        ]);

        let mut sum = 0u64;
        for _ in 0..25 {
            sum += nes.step_instruction() as u64;
        }
        assert_eq!(sum, nes.debug_total_cycles());
        assert_eq!(nes.debug_instruction_count(), 25);
    }
}
