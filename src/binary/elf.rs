// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! ELF-backed disassembler
//!
//! Parses a binary's executable `LOAD` segments, symbol tables and
//! relocations up front, then decodes instructions lazily through capstone.
//! Position-independent binaries are rebased to their mapped load address;
//! fixed binaries ignore it.

use std::path::{Path, PathBuf};

use capstone::arch::x86::{ArchMode, X86Operand, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use elf::abi;
use elf::endian::{AnyEndian, EndianParse};
use elf::ElfBytes;
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::types::Rva;

use super::{Disassembler, Error, Instruction, Kind, Source};

/// Longest x86 instruction encoding
const MAX_INSN_LEN: usize = 15;

struct Segment {
    vaddr: u64,
    data: Vec<u8>,
}

struct FuncSym {
    addr: u64,
    size: u64,
    name: String,
}

/// [`Disassembler`] over one ELF binary at one load address
pub struct ElfDisassembler {
    segments: Vec<Segment>,
    /// Added to file virtual addresses to get runtime addresses
    bias: u64,
    /// Function symbols sorted by address
    functions: Vec<FuncSym>,
    exports: FxHashMap<String, u64>,
    relocations: FxHashMap<u64, String>,
    capstone: Capstone,
    cache: FxHashMap<Rva, Instruction>,
}

impl ElfDisassembler {
    /// Parse a binary from disk
    pub fn load(path: &Path, load_address: Rva) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Self::parse(&data, load_address)
    }

    /// Parse a binary from bytes
    pub fn parse(data: &[u8], load_address: Rva) -> Result<Self, Error> {
        let file = ElfBytes::<AnyEndian>::minimal_parse(data)?;

        if file.ehdr.e_machine != abi::EM_X86_64 {
            return Err(Error::UnsupportedArchitecture);
        }
        if !file.ehdr.endianness.is_little() {
            return Err(Error::UnsupportedEndianness);
        }
        let bias = if file.ehdr.e_type == abi::ET_DYN {
            load_address
        } else {
            0
        };

        let mut segments = Vec::new();
        for phdr in file.segments().into_iter().flat_map(|s| s.iter()) {
            if phdr.p_type == abi::PT_LOAD && phdr.p_flags & abi::PF_X != 0 {
                let data = file.segment_data(&phdr)?;
                segments.push(Segment {
                    vaddr: phdr.p_vaddr,
                    data: data.to_vec(),
                });
            }
        }

        let mut functions = Vec::new();
        let mut exports = FxHashMap::default();
        for table in [file.symbol_table()?, file.dynamic_symbol_table()?] {
            let Some((symtab, strtab)) = table else {
                continue;
            };
            for sym in symtab.iter() {
                if sym.st_symtype() != abi::STT_FUNC
                    || sym.st_shndx == abi::SHN_UNDEF
                    || sym.st_value == 0
                {
                    continue;
                }
                let Ok(name) = strtab.get(sym.st_name as usize) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                functions.push(FuncSym {
                    addr: sym.st_value,
                    size: sym.st_size,
                    name: name.to_string(),
                });
                if sym.st_bind() == abi::STB_GLOBAL || sym.st_bind() == abi::STB_WEAK {
                    exports.entry(name.to_string()).or_insert(sym.st_value);
                }
            }
        }
        functions.sort_by_key(|f| f.addr);
        functions.dedup_by_key(|f| f.addr);

        let mut relocations = FxHashMap::default();
        if let (Some(shdrs), Ok(Some((dynsyms, dynstrs)))) =
            (file.section_headers(), file.dynamic_symbol_table())
        {
            for shdr in shdrs.iter().filter(|s| s.sh_type == abi::SHT_RELA) {
                let Ok(relas) = file.section_data_as_relas(&shdr) else {
                    continue;
                };
                for rela in relas {
                    let Ok(sym) = dynsyms.get(rela.r_sym as usize) else {
                        continue;
                    };
                    let Ok(name) = dynstrs.get(sym.st_name as usize) else {
                        continue;
                    };
                    if !name.is_empty() {
                        relocations.insert(rela.r_offset, name.to_string());
                    }
                }
            }
        }

        let capstone = Capstone::new()
            .x86()
            .mode(ArchMode::Mode64)
            .detail(true)
            .build()
            .map_err(|e| Error::Backend(e.to_string()))?;

        Ok(Self {
            segments,
            bias,
            functions,
            exports,
            relocations,
            capstone,
            cache: FxHashMap::default(),
        })
    }

    /// Raw instruction bytes at a file virtual address
    fn bytes_at(&self, vaddr: u64) -> Option<&[u8]> {
        // executable segments are few; a linear scan wins over bookkeeping
        self.segments.iter().find_map(|s| {
            let offset = vaddr.checked_sub(s.vaddr)? as usize;
            let data = s.data.get(offset..)?;
            (!data.is_empty()).then(|| &data[..data.len().min(MAX_INSN_LEN)])
        })
    }

    fn classify(&self, insn: &capstone::Insn) -> Result<Kind, Error> {
        let detail = self
            .capstone
            .insn_detail(insn)
            .map_err(|e| Error::Backend(e.to_string()))?;
        let groups: Vec<String> = detail
            .groups()
            .iter()
            .filter_map(|id| self.capstone.group_name(*id))
            .collect();
        let has_group = |name: &str| groups.iter().any(|g| g == name);

        let immediate = || {
            detail.arch_detail().operands().into_iter().find_map(|op| {
                if let ArchOperand::X86Operand(X86Operand {
                    op_type: X86OperandType::Imm(imm),
                    ..
                }) = op
                {
                    Some(imm as u64)
                } else {
                    None
                }
            })
        };

        let mnemonic = insn.mnemonic().unwrap_or("");
        let kind = if has_group("iret") {
            Kind::InterruptReturn
        } else if has_group("ret") {
            Kind::Return
        } else if has_group("int") {
            Kind::Syscall
        } else if has_group("call") {
            match immediate() {
                Some(target) => Kind::DirectCall(target),
                None => Kind::IndirectCall,
            }
        } else if has_group("jump") {
            match immediate() {
                Some(target) if !mnemonic.starts_with("jmp") => {
                    Kind::DirectConditional(target)
                }
                Some(target) => Kind::DirectJump(target),
                None => Kind::IndirectJump,
            }
        } else if mnemonic.starts_with("sysret") || mnemonic.starts_with("sysexit") {
            Kind::InterruptReturn
        } else {
            Kind::Other
        };
        Ok(kind)
    }
}

impl Disassembler for ElfDisassembler {
    fn decode(&mut self, address: Rva) -> Result<Instruction, Error> {
        if let Some(cached) = self.cache.get(&address) {
            return Ok(cached.clone());
        }

        let vaddr = address
            .checked_sub(self.bias)
            .ok_or(Error::NoInstruction(address))?;
        let bytes = self.bytes_at(vaddr).ok_or(Error::NoInstruction(address))?;

        let insns = self
            .capstone
            .disasm_count(bytes, address, 1)
            .map_err(|e| Error::Backend(e.to_string()))?;
        let insn = insns.iter().next().ok_or(Error::NoInstruction(address))?;

        let kind = match self.classify(insn) {
            Ok(kind) => kind,
            Err(e) => return Err(e),
        };
        let instruction = Instruction {
            next: address + insn.bytes().len() as u64,
            kind,
            text: match insn.op_str() {
                Some(ops) if !ops.is_empty() => {
                    format!("{} {}", insn.mnemonic().unwrap_or("?"), ops)
                }
                _ => insn.mnemonic().unwrap_or("?").to_string(),
            },
        };
        drop(insns);

        self.cache.insert(address, instruction.clone());
        Ok(instruction)
    }

    fn function_at(&self, address: Rva) -> Option<(String, u64)> {
        let vaddr = address.checked_sub(self.bias)?;
        let i = self.functions.partition_point(|f| f.addr <= vaddr);
        let sym = self.functions[..i].last()?;
        if sym.size != 0 && vaddr >= sym.addr + sym.size {
            return None;
        }
        Some((sym.name.clone(), vaddr - sym.addr))
    }

    fn relocation_at(&self, address: Rva) -> Option<String> {
        let vaddr = address.checked_sub(self.bias)?;
        self.relocations.get(&vaddr).cloned()
    }

    fn global_function(&self, name: &str) -> Option<Rva> {
        self.exports.get(name).map(|a| a + self.bias)
    }
}

/// Caching [`Source`] over on-disk ELF binaries
///
/// Handles are keyed by `(path, load address)`. Paths recorded in the
/// capture refer to the traced system; an optional sysroot maps them onto
/// the analysis host. Binaries that fail to load are remembered so the
/// replay does not retry them for every instruction.
pub struct ElfRegistry {
    sysroot: Option<PathBuf>,
    handles: FxHashMap<(String, Rva), ElfDisassembler>,
    failed: FxHashSet<(String, Rva)>,
}

impl ElfRegistry {
    pub fn new(sysroot: Option<PathBuf>) -> Self {
        Self {
            sysroot,
            handles: FxHashMap::default(),
            failed: FxHashSet::default(),
        }
    }

    /// Map a target path onto the analysis host
    pub fn host_path(&self, path: &str) -> PathBuf {
        match &self.sysroot {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

impl Source for ElfRegistry {
    fn obtain(&mut self, path: &str, load_address: Rva) -> Option<&mut dyn Disassembler> {
        let key = (path.to_string(), load_address);
        if self.failed.contains(&key) {
            return None;
        }
        if !self.handles.contains_key(&key) {
            let host = self.host_path(path);
            match ElfDisassembler::load(&host, load_address) {
                Ok(handle) => {
                    debug!("loaded {} at {load_address:#x}", host.display());
                    self.handles.insert(key.clone(), handle);
                }
                Err(e) => {
                    warn!("cannot load {}: {e}", host.display());
                    self.failed.insert(key);
                    return None;
                }
            }
        }
        self.handles
            .get_mut(&key)
            .map(|h| h as &mut dyn Disassembler)
    }

    fn host_location(&self, path: &str) -> Option<String> {
        Some(self.host_path(path).to_string_lossy().into_owned())
    }
}
