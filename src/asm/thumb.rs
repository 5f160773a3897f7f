use std::collections::HashMap;

use super::{Assembler, AssemblyError};

const NOP: u16 = 0xbf00;

/// Two-pass assembler for the Thumb subset the patch routines need.
///
/// Supported: `push`/`pop`, `mov`/`movs`/`movw`, `adds`/`subs` with an 8-bit
/// immediate, `cmp`, `ldr`/`str`/`ldrb`/`strb` with immediate offsets,
/// `ldr rX, =value` through a literal pool placed after the code,
/// `b`/`b<cond>`/`bl`/`bx`, `nop` and `.word`. Comments start with `//`,
/// `;` separates statements on one line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbAssembler;

struct Instr {
    line: usize,
    address: u32,
    mnemonic: String,
    operands: Vec<String>,
}

impl Assembler for ThumbAssembler {
    fn assemble(&self, source: &str, load_address: u32) -> Result<Vec<u8>, AssemblyError> {
        if load_address % 2 != 0 {
            return Err(AssemblyError::OutOfRange {
                line: 0,
                message: format!("load address 0x{:x} is not halfword aligned", load_address),
            });
        }

        // Pass 1: addresses of labels and instructions.
        let mut labels: HashMap<String, u32> = HashMap::new();
        let mut instrs = Vec::new();
        let mut pc = load_address;

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let text = match raw.find("//") {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            for stmt in text.split(';') {
                let mut stmt = stmt.trim();
                while let Some((head, rest)) = stmt.split_once(':') {
                    let head = head.trim();
                    if !is_identifier(head) {
                        break;
                    }
                    if labels.insert(head.to_string(), pc).is_some() {
                        return Err(AssemblyError::DuplicateLabel {
                            line,
                            label: head.to_string(),
                        });
                    }
                    stmt = rest.trim();
                }
                if stmt.is_empty() {
                    continue;
                }

                let (mnemonic, rest) = match stmt.split_once(char::is_whitespace) {
                    Some((m, r)) => (m, r.trim()),
                    None => (stmt, ""),
                };
                let mnemonic = mnemonic.to_ascii_lowercase();
                let operands = split_operands(rest);
                let size = instr_size(&mnemonic, &operands);
                instrs.push(Instr {
                    line,
                    address: pc,
                    mnemonic,
                    operands,
                });
                pc = pc.checked_add(size).ok_or_else(|| AssemblyError::OutOfRange {
                    line,
                    message: "code runs past the end of the address space".into(),
                })?;
            }
        }

        // Pass 2: encode, collecting literals.
        let pool_base = pc.checked_add(3).map(|a| a & !3);
        let mut encoder = Encoder {
            labels: &labels,
            pool: Vec::new(),
            pool_base,
        };
        let mut out = Vec::new();
        for instr in &instrs {
            for hw in encoder.encode(instr)? {
                out.extend_from_slice(&hw.to_le_bytes());
            }
        }

        if !encoder.pool.is_empty() {
            let pool_len = encoder.pool.len() as u32 * 4;
            let pool_base = pool_base
                .filter(|base| (base - 1).checked_add(pool_len).is_some())
                .ok_or_else(|| past_end("literal pool"))?;
            if pool_base != pc {
                out.extend_from_slice(&NOP.to_le_bytes());
            }
            for word in &encoder.pool {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }

        Ok(out)
    }
}

fn instr_size(mnemonic: &str, operands: &[String]) -> u32 {
    match mnemonic {
        "bl" | "movw" | ".word" => 4,
        // `mov` silently widens to MOVW when the immediate needs it
        "mov" => match operands.get(1).and_then(|o| parse_imm(o)) {
            Some(v) if !(0..=0xff).contains(&v) => 4,
            _ => 2,
        },
        _ => 2,
    }
}

struct Encoder<'a> {
    labels: &'a HashMap<String, u32>,
    pool: Vec<u32>,
    pool_base: Option<u32>,
}

impl Encoder<'_> {
    fn encode(&mut self, ins: &Instr) -> Result<Vec<u16>, AssemblyError> {
        let ops = &ins.operands;
        match ins.mnemonic.as_str() {
            "nop" => {
                expect_operands(ins, 0)?;
                Ok(vec![NOP])
            }
            "bx" => {
                expect_operands(ins, 1)?;
                let rm = reg(ins, 0)?;
                Ok(vec![0x4700 | (rm as u16) << 3])
            }
            "push" | "pop" => {
                expect_operands(ins, 1)?;
                let is_push = ins.mnemonic == "push";
                let (mask, extra) = reg_list(ins, &ops[0], if is_push { 14 } else { 15 })?;
                let base = if is_push { 0xb400 } else { 0xbc00 };
                Ok(vec![base | (extra as u16) << 8 | mask])
            }
            "mov" | "movs" => {
                expect_operands(ins, 2)?;
                let rd = reg(ins, 0)?;
                if let Some(rm) = parse_reg(&ops[1]) {
                    let rd = low(ins, rd)?;
                    let rm = low(ins, rm)?;
                    // encoded as LSLS rd, rm, #0
                    return Ok(vec![(rm as u16) << 3 | rd as u16]);
                }
                let value = imm(ins, 1)?;
                if (0..=0xff).contains(&value) {
                    let rd = low(ins, rd)?;
                    Ok(vec![0x2000 | (rd as u16) << 8 | value as u16])
                } else if ins.mnemonic == "mov" {
                    movw(ins, rd, value)
                } else {
                    Err(out_of_range(ins, format!("movs immediate {} needs more than 8 bits", value)))
                }
            }
            "movw" => {
                expect_operands(ins, 2)?;
                let rd = reg(ins, 0)?;
                let value = imm(ins, 1)?;
                movw(ins, rd, value)
            }
            "add" | "adds" | "sub" | "subs" => {
                expect_operands(ins, 2)?;
                let rd = low(ins, reg(ins, 0)?)?;
                let value = imm(ins, 1)?;
                if !(0..=0xff).contains(&value) {
                    return Err(out_of_range(ins, format!("immediate {} needs more than 8 bits", value)));
                }
                let base = if ins.mnemonic.starts_with("add") { 0x3000 } else { 0x3800 };
                Ok(vec![base | (rd as u16) << 8 | value as u16])
            }
            "cmp" => {
                expect_operands(ins, 2)?;
                let rn = low(ins, reg(ins, 0)?)?;
                if let Some(rm) = parse_reg(&ops[1]) {
                    let rm = low(ins, rm)?;
                    return Ok(vec![0x4280 | (rm as u16) << 3 | rn as u16]);
                }
                let value = imm(ins, 1)?;
                if !(0..=0xff).contains(&value) {
                    return Err(out_of_range(ins, format!("compare immediate {} needs more than 8 bits", value)));
                }
                Ok(vec![0x2800 | (rn as u16) << 8 | value as u16])
            }
            "ldr" if ops.len() == 2 && ops[1].starts_with('=') => self.literal(ins),
            "ldr" | "str" | "ldrb" | "strb" => {
                expect_operands(ins, 2)?;
                let rt = low(ins, reg(ins, 0)?)?;
                let (rn, offset) = mem_operand(ins, &ops[1])?;
                let rn = low(ins, rn)?;
                let (base, scale) = match ins.mnemonic.as_str() {
                    "ldr" => (0x6800, 4),
                    "str" => (0x6000, 4),
                    "ldrb" => (0x7800, 1),
                    _ => (0x7000, 1),
                };
                if offset < 0 || offset % scale != 0 || offset / scale > 31 {
                    return Err(out_of_range(ins, format!("offset #{} not encodable", offset)));
                }
                Ok(vec![base | ((offset / scale) as u16) << 6 | (rn as u16) << 3 | rt as u16])
            }
            "bl" => {
                expect_operands(ins, 1)?;
                let target = (self.value(ins, &ops[0])? as u32) & !1;
                let offset = target as i64 - (ins.address as i64 + 4);
                if !(-(1 << 24)..=(1 << 24) - 2).contains(&offset) {
                    return Err(out_of_range(
                        ins,
                        format!("bl target 0x{:x} is beyond +/-16MiB of 0x{:x}", target, ins.address),
                    ));
                }
                let s = ((offset >> 24) & 1) as u16;
                let i1 = ((offset >> 23) & 1) as u16;
                let i2 = ((offset >> 22) & 1) as u16;
                let j1 = (!i1 ^ s) & 1;
                let j2 = (!i2 ^ s) & 1;
                let imm10 = ((offset >> 12) & 0x3ff) as u16;
                let imm11 = ((offset >> 1) & 0x7ff) as u16;
                Ok(vec![
                    0xf000 | s << 10 | imm10,
                    0xd000 | j1 << 13 | j2 << 11 | imm11,
                ])
            }
            "b" => {
                expect_operands(ins, 1)?;
                let offset = self.branch_offset(ins, -2048, 2046)?;
                Ok(vec![0xe000 | ((offset >> 1) & 0x7ff) as u16])
            }
            ".word" => {
                expect_operands(ins, 1)?;
                let word = self.value(ins, &ops[0])? as u32;
                Ok(vec![word as u16, (word >> 16) as u16])
            }
            m => match m.strip_prefix('b').and_then(cond_code) {
                Some(cond) => {
                    expect_operands(ins, 1)?;
                    let offset = self.branch_offset(ins, -256, 254)?;
                    Ok(vec![0xd000 | cond << 8 | ((offset >> 1) & 0xff) as u16])
                }
                None => Err(AssemblyError::UnknownMnemonic {
                    line: ins.line,
                    mnemonic: ins.mnemonic.clone(),
                }),
            },
        }
    }

    fn literal(&mut self, ins: &Instr) -> Result<Vec<u16>, AssemblyError> {
        let rt = low(ins, reg(ins, 0)?)?;
        let value = self.value(ins, ins.operands[1][1..].trim())? as u32;
        let slot = match self.pool.iter().position(|&w| w == value) {
            Some(i) => i,
            None => {
                self.pool.push(value);
                self.pool.len() - 1
            }
        };
        let pool_base = self.pool_base.ok_or_else(|| past_end("literal pool"))?;
        let literal = pool_base as i64 + slot as i64 * 4;
        let base = (ins.address as i64 + 4) & !3;
        let offset = literal - base;
        if !(0..=1020).contains(&offset) {
            return Err(out_of_range(
                ins,
                format!("literal pool is {} bytes away, ldr reaches 1020", offset),
            ));
        }
        Ok(vec![0x4800 | (rt as u16) << 8 | (offset / 4) as u16])
    }

    fn branch_offset(&self, ins: &Instr, min: i64, max: i64) -> Result<i64, AssemblyError> {
        let target = self.value(ins, &ins.operands[0])?;
        let offset = target - (ins.address as i64 + 4);
        if offset % 2 != 0 || !(min..=max).contains(&offset) {
            return Err(out_of_range(
                ins,
                format!("branch to 0x{:x} from 0x{:x}", target, ins.address),
            ));
        }
        Ok(offset)
    }

    fn value(&self, ins: &Instr, operand: &str) -> Result<i64, AssemblyError> {
        if let Some(v) = parse_imm(operand) {
            return Ok(v);
        }
        let name = operand.trim();
        match self.labels.get(name) {
            Some(&addr) => Ok(addr as i64),
            None if is_identifier(name) => Err(AssemblyError::UndefinedLabel {
                line: ins.line,
                label: name.to_string(),
            }),
            None => Err(bad_operand(ins, format!("cannot evaluate '{}'", name))),
        }
    }
}

fn movw(ins: &Instr, rd: u8, value: i64) -> Result<Vec<u16>, AssemblyError> {
    if rd == 13 || rd == 15 {
        return Err(bad_operand(ins, "movw cannot target sp or pc".to_string()));
    }
    if !(0..=0xffff).contains(&value) {
        return Err(out_of_range(ins, format!("movw immediate 0x{:x} exceeds 16 bits", value)));
    }
    let v = value as u16;
    let imm4 = v >> 12;
    let i = (v >> 11) & 1;
    let imm3 = (v >> 8) & 0x7;
    let imm8 = v & 0xff;
    Ok(vec![0xf240 | i << 10 | imm4, imm3 << 12 | (rd as u16) << 8 | imm8])
}

fn cond_code(cond: &str) -> Option<u16> {
    Some(match cond {
        "eq" => 0x0,
        "ne" => 0x1,
        "cs" | "hs" => 0x2,
        "cc" | "lo" => 0x3,
        "mi" => 0x4,
        "pl" => 0x5,
        "vs" => 0x6,
        "vc" => 0x7,
        "hi" => 0x8,
        "ls" => 0x9,
        "ge" => 0xa,
        "lt" => 0xb,
        "gt" => 0xc,
        "le" => 0xd,
        _ => return None,
    })
}

fn reg_list(ins: &Instr, operand: &str, extra_reg: u8) -> Result<(u16, bool), AssemblyError> {
    let inner = operand
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| bad_operand(ins, format!("expected register list, got '{}'", operand)))?;

    let mut mask = 0u16;
    let mut extra = false;
    for item in inner.split(',') {
        let item = item.trim();
        if let Some((lo, hi)) = item.split_once('-') {
            let lo = parse_reg(lo).ok_or_else(|| bad_operand(ins, format!("bad register '{}'", lo)))?;
            let hi = parse_reg(hi).ok_or_else(|| bad_operand(ins, format!("bad register '{}'", hi)))?;
            if lo > hi || hi > 7 {
                return Err(bad_operand(ins, format!("bad register range '{}'", item)));
            }
            for r in lo..=hi {
                mask |= 1 << r;
            }
        } else {
            match parse_reg(item) {
                Some(r) if r < 8 => mask |= 1 << r,
                Some(r) if r == extra_reg => extra = true,
                _ => return Err(bad_operand(ins, format!("register '{}' not allowed here", item))),
            }
        }
    }
    if mask == 0 && !extra {
        return Err(bad_operand(ins, "empty register list".to_string()));
    }
    Ok((mask, extra))
}

fn mem_operand(ins: &Instr, operand: &str) -> Result<(u8, i64), AssemblyError> {
    let malformed = || bad_operand(ins, format!("expected [rN] or [rN, #imm], got '{}'", operand));
    let inner = operand
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(malformed)?;
    let mut parts = inner.split(',');
    let rn = parts.next().and_then(parse_reg).ok_or_else(malformed)?;
    let offset = match parts.next() {
        Some(p) => parse_imm(p).ok_or_else(malformed)?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok((rn, offset))
}

fn split_operands(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() || !out.is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn parse_reg(s: &str) -> Option<u8> {
    match s.trim().to_ascii_lowercase().as_str() {
        "sp" => Some(13),
        "lr" => Some(14),
        "pc" => Some(15),
        other => {
            let n: u8 = other.strip_prefix('r')?.parse().ok()?;
            (n < 16).then_some(n)
        }
    }
}

fn parse_imm(s: &str) -> Option<i64> {
    let s = s.trim();
    let s = s.strip_prefix('#').unwrap_or(s).trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = s.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        s.parse::<i64>().ok()?
    };
    Some(if negative { -v } else { v })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn expect_operands(ins: &Instr, n: usize) -> Result<(), AssemblyError> {
    if ins.operands.len() != n {
        return Err(bad_operand(
            ins,
            format!("'{}' takes {} operand(s), got {}", ins.mnemonic, n, ins.operands.len()),
        ));
    }
    Ok(())
}

fn reg(ins: &Instr, idx: usize) -> Result<u8, AssemblyError> {
    let op = &ins.operands[idx];
    parse_reg(op).ok_or_else(|| bad_operand(ins, format!("expected register, got '{}'", op)))
}

fn low(ins: &Instr, r: u8) -> Result<u8, AssemblyError> {
    if r > 7 {
        return Err(bad_operand(ins, format!("r{} is not a low register", r)));
    }
    Ok(r)
}

fn imm(ins: &Instr, idx: usize) -> Result<i64, AssemblyError> {
    let op = &ins.operands[idx];
    parse_imm(op).ok_or_else(|| bad_operand(ins, format!("expected immediate, got '{}'", op)))
}

fn bad_operand(ins: &Instr, message: String) -> AssemblyError {
    AssemblyError::BadOperand {
        line: ins.line,
        message,
    }
}

fn past_end(what: &str) -> AssemblyError {
    AssemblyError::OutOfRange {
        line: 0,
        message: format!("{} runs past the end of the address space", what),
    }
}

fn out_of_range(ins: &Instr, message: String) -> AssemblyError {
    AssemblyError::OutOfRange {
        line: ins.line,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(src: &str, at: u32) -> Vec<u8> {
        ThumbAssembler.assemble(src, at).unwrap()
    }

    #[test]
    fn test_bx_lr() {
        assert_eq!(asm("bx lr", 0), vec![0x70, 0x47]);
    }

    #[test]
    fn test_statement_separator() {
        assert_eq!(asm("bx lr; bx lr", 0xa562e), vec![0x70, 0x47, 0x70, 0x47]);
    }

    #[test]
    fn test_push_pop_lists() {
        assert_eq!(asm("push {r0-r7, lr}", 0), vec![0xff, 0xb5]);
        assert_eq!(asm("pop {r0-r4, pc}", 0), vec![0x1f, 0xbd]);
    }

    #[test]
    fn test_bl_forward_label() {
        let out = asm("bl next\nnext:\nbx lr", 0);
        assert_eq!(out, vec![0x00, 0xf0, 0x00, 0xf8, 0x70, 0x47]);
    }

    #[test]
    fn test_bl_to_self() {
        assert_eq!(asm("bl 0x100", 0x100), vec![0xff, 0xf7, 0xfe, 0xff]);
    }

    #[test]
    fn test_bl_out_of_range() {
        let err = ThumbAssembler.assemble("bl 0x2000000", 0).unwrap_err();
        assert!(matches!(err, AssemblyError::OutOfRange { line: 1, .. }));
    }

    #[test]
    fn test_literal_pool() {
        let out = asm("ldr r0, =0x12345678\nbx lr", 0);
        assert_eq!(out, vec![0x00, 0x48, 0x70, 0x47, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_literal_pool_is_aligned_and_deduplicated() {
        let out = asm("ldr r0, =0x1\nldr r1, =0x1\nbx lr", 0);
        // 6 bytes of code, 2 bytes padding, one shared literal
        assert_eq!(out.len(), 12);
        assert_eq!(&out[0..2], &[0x01, 0x48]);
        assert_eq!(&out[2..4], &[0x01, 0x49]);
        assert_eq!(&out[6..8], &[0x00, 0xbf]);
        assert_eq!(&out[8..12], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_movw() {
        assert_eq!(asm("movw r0, #0xfc4e", 0), vec![0x4f, 0xf6, 0x4e, 0x40]);
        assert_eq!(asm("mov r0, #0xfc4e", 0), vec![0x4f, 0xf6, 0x4e, 0x40]);
    }

    #[test]
    fn test_data_processing() {
        assert_eq!(asm("movs r3, #0x42", 0), vec![0x42, 0x23]);
        assert_eq!(asm("mov r1, 0", 0), vec![0x00, 0x21]);
        assert_eq!(asm("cmp r2, r3", 0), vec![0x9a, 0x42]);
        assert_eq!(asm("adds r1, #4", 0), vec![0x04, 0x31]);
    }

    #[test]
    fn test_loads_and_stores() {
        assert_eq!(asm("ldr r2, [r2]", 0), vec![0x12, 0x68]);
        assert_eq!(asm("str r3, [r1]", 0), vec![0x0b, 0x60]);
        assert_eq!(asm("strb r3, [r1]", 0), vec![0x0b, 0x70]);
        assert_eq!(asm("ldr r0, [r1, #8]", 0), vec![0x88, 0x68]);
    }

    #[test]
    fn test_conditional_branch_backward() {
        let out = asm("loop: subs r0, #1\nbne loop", 0);
        assert_eq!(out, vec![0x01, 0x38, 0xfd, 0xd1]);
    }

    #[test]
    fn test_word_directive() {
        assert_eq!(asm(".word 0x444e4152", 0), b"RAND".to_vec());
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            ThumbAssembler.assemble("bl missing", 0),
            Err(AssemblyError::UndefinedLabel { .. })
        ));
        assert!(matches!(
            ThumbAssembler.assemble("frob r0", 0),
            Err(AssemblyError::UnknownMnemonic { .. })
        ));
        assert!(matches!(
            ThumbAssembler.assemble("a:\na: nop", 0),
            Err(AssemblyError::DuplicateLabel { line: 2, .. })
        ));
        assert!(matches!(
            ThumbAssembler.assemble("movs r0, #256", 0),
            Err(AssemblyError::OutOfRange { .. })
        ));
        assert!(matches!(
            ThumbAssembler.assemble("adds r8, #1", 0),
            Err(AssemblyError::BadOperand { .. })
        ));
    }

    #[test]
    fn test_image_at_top_of_address_space() {
        assert_eq!(asm("bx lr", 0xffff_fffc), vec![0x70, 0x47]);
        assert!(matches!(
            ThumbAssembler.assemble("nop; nop; nop", 0xffff_fffc),
            Err(AssemblyError::OutOfRange { line: 1, .. })
        ));
        // code fits, its literal pool does not
        assert!(matches!(
            ThumbAssembler.assemble("ldr r0, =1; ldr r1, =2", 0xffff_fff8),
            Err(AssemblyError::OutOfRange { line: 0, .. })
        ));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        assert_eq!(asm("\n  // only a comment\n\nbx lr // return\n", 0), vec![0x70, 0x47]);
    }
}
