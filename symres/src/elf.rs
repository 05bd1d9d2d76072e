// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! ELF symbol resolution. Candidate modules come from `/proc/self/maps`;
//! each module file is mapped privately and its `.symtab`, then `.dynsym`,
//! is searched. The runtime address is the file-local `st_value` rebased
//! by the module's load address and load bias.

use core::ffi::CStr;
use std::fs::File;
use std::io::{BufRead, BufReader};

use log::debug;

use crate::filemap::FileMap;
use crate::{ResolveError, SymbolLookup};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const PT_LOAD: u32 = 1;
const PT_PHDR: u32 = 6;

const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_DYNSYM: u32 = 11;

const SYM_ENTSIZE: usize = 24;

/// ELF implementation of [`SymbolLookup`].
#[derive(Clone, Copy, Debug)]
pub struct ElfSymbols;

/// One file-backed module of the running process.
#[derive(Debug)]
struct RuntimeModule {
    base: usize,
    path: String,
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16, ResolveError> {
    let bytes = buf.get(off..off + 2).ok_or(ResolveError::UnexpectedFormat)?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32, ResolveError> {
    let bytes = buf.get(off..off + 4).ok_or(ResolveError::UnexpectedFormat)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64, ResolveError> {
    let bytes = buf.get(off..off + 8).ok_or(ResolveError::UnexpectedFormat)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Parses one `/proc/self/maps` line into a module candidate: a private
/// readable file-backed mapping whose first bytes are an ELF header.
fn parse_maps_line(line: &str) -> Result<Option<RuntimeModule>, ResolveError> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next().ok_or(ResolveError::UnexpectedFormat)?;
    let perms = fields.next().ok_or(ResolveError::UnexpectedFormat)?;
    let _offset = fields.next().ok_or(ResolveError::UnexpectedFormat)?;
    let _dev = fields.next().ok_or(ResolveError::UnexpectedFormat)?;
    let _inode = fields.next().ok_or(ResolveError::UnexpectedFormat)?;
    // The path column is padded with spaces; anonymous mappings omit it.
    let path = fields.next().unwrap_or("").trim_start();

    if perms != "r--p" && perms != "r-xp" {
        return Ok(None);
    }
    if path.is_empty() || path.starts_with('[') {
        return Ok(None);
    }

    let (start, _) = range.split_once('-').ok_or(ResolveError::UnexpectedFormat)?;
    let start = usize::from_str_radix(start, 16).map_err(|_| ResolveError::UnexpectedFormat)?;

    // SAFETY: the mapping is readable per its permission field; only the
    // first four bytes are inspected.
    let magic = unsafe { core::slice::from_raw_parts(start as *const u8, 4) };
    if magic != ELF_MAGIC {
        return Ok(None);
    }

    Ok(Some(RuntimeModule {
        base: start,
        path: path.to_string(),
    }))
}

fn process_modules() -> Result<Vec<RuntimeModule>, ResolveError> {
    let file = File::open("/proc/self/maps").map_err(|_| ResolveError::ProcMapsOpen)?;
    let mut modules = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|_| ResolveError::ProcMapsOpen)?;
        if let Some(module) = parse_maps_line(&line)? {
            modules.push(module);
        }
    }
    Ok(modules)
}

/// Offsets of one symbol table and its string table within the file.
#[derive(Clone, Copy, Debug, Default)]
struct SymtabRef {
    sym_off: usize,
    sym_count: usize,
    str_off: usize,
}

/// Parsed view of a module file: the load bias of its runtime image and
/// the symbol tables to search. All offsets are file relative.
#[derive(Debug, Default)]
struct ElfImage {
    /// `map_base - (p_vaddr - p_offset)` of the first `PT_LOAD`, or the
    /// `PT_PHDR` form when present.
    load_bias: usize,
    symtab: Option<SymtabRef>,
    dynsym: Option<SymtabRef>,
}

fn section_name<'a>(buf: &'a [u8], shstr_off: usize, name: usize) -> Result<&'a str, ResolveError> {
    let start = shstr_off
        .checked_add(name)
        .ok_or(ResolveError::UnexpectedFormat)?;
    let tail = buf.get(start..).ok_or(ResolveError::UnexpectedFormat)?;
    CStr::from_bytes_until_nul(tail)
        .map_err(|_| ResolveError::UnexpectedFormat)?
        .to_str()
        .map_err(|_| ResolveError::UnexpectedFormat)
}

impl ElfImage {
    fn parse(buf: &[u8], map_base: usize) -> Result<Self, ResolveError> {
        if buf.len() < 64 || buf[..4] != ELF_MAGIC {
            return Err(ResolveError::UnexpectedFormat);
        }
        let e_phoff = read_u64(buf, 32)? as usize;
        let e_shoff = read_u64(buf, 40)? as usize;
        let e_phentsize = usize::from(read_u16(buf, 54)?);
        let e_phnum = usize::from(read_u16(buf, 56)?);
        let e_shentsize = usize::from(read_u16(buf, 58)?);
        let e_shnum = usize::from(read_u16(buf, 60)?);
        let e_shstrndx = usize::from(read_u16(buf, 62)?);
        if e_phentsize < 56 || e_shentsize < 64 || e_shstrndx >= e_shnum {
            return Err(ResolveError::UnexpectedFormat);
        }

        let mut image = Self::default();

        // The first PT_LOAD fixes the bias; a PT_PHDR overrides it with
        // the program-header table's own runtime displacement.
        let mut have_bias = false;
        for i in 0..e_phnum {
            let off = e_phoff
                .checked_add(i * e_phentsize)
                .ok_or(ResolveError::UnexpectedFormat)?;
            let p_type = read_u32(buf, off)?;
            let p_offset = read_u64(buf, off + 8)? as usize;
            let p_vaddr = read_u64(buf, off + 16)? as usize;
            if p_type == PT_LOAD && !have_bias {
                image.load_bias = map_base.wrapping_add(p_offset).wrapping_sub(p_vaddr);
                have_bias = true;
            } else if p_type == PT_PHDR {
                image.load_bias = map_base.wrapping_add(e_phoff).wrapping_sub(p_vaddr);
                have_bias = true;
            }
        }

        let shstr_shdr = e_shoff
            .checked_add(e_shstrndx * e_shentsize)
            .ok_or(ResolveError::UnexpectedFormat)?;
        let shstr_off = read_u64(buf, shstr_shdr + 24)? as usize;

        let mut symtab = SymtabRef::default();
        let mut dynsym = SymtabRef::default();
        let mut have_symtab = false;
        let mut have_dynsym = false;
        let mut have_strtab = false;
        let mut have_dynstr = false;

        for i in 0..e_shnum {
            let off = e_shoff
                .checked_add(i * e_shentsize)
                .ok_or(ResolveError::UnexpectedFormat)?;
            let sh_name = read_u32(buf, off)? as usize;
            let sh_type = read_u32(buf, off + 4)?;
            let sh_offset = read_u64(buf, off + 24)? as usize;
            let sh_size = read_u64(buf, off + 32)? as usize;

            match sh_type {
                SHT_SYMTAB => {
                    symtab.sym_off = sh_offset;
                    symtab.sym_count = sh_size / SYM_ENTSIZE;
                    have_symtab = true;
                }
                SHT_DYNSYM => {
                    dynsym.sym_off = sh_offset;
                    dynsym.sym_count = sh_size / SYM_ENTSIZE;
                    have_dynsym = true;
                }
                SHT_STRTAB => match section_name(buf, shstr_off, sh_name)? {
                    ".strtab" => {
                        symtab.str_off = sh_offset;
                        have_strtab = true;
                    }
                    ".dynstr" => {
                        dynsym.str_off = sh_offset;
                        have_dynstr = true;
                    }
                    _ => (),
                },
                _ => (),
            }
        }

        if have_symtab && have_strtab {
            image.symtab = Some(symtab);
        }
        if have_dynsym && have_dynstr {
            image.dynsym = Some(dynsym);
        }
        Ok(image)
    }

    /// Searches `.symtab` first, then `.dynsym`, for an exact name match
    /// with a non-zero value.
    fn lookup(&self, buf: &[u8], symbol: &str) -> Option<u64> {
        [self.symtab, self.dynsym]
            .iter()
            .flatten()
            .find_map(|table| search_table(buf, *table, symbol))
    }
}

fn search_table(buf: &[u8], table: SymtabRef, symbol: &str) -> Option<u64> {
    for i in 0..table.sym_count {
        let off = table.sym_off.checked_add(i * SYM_ENTSIZE)?;
        let st_name = read_u32(buf, off).ok()? as usize;
        let st_value = read_u64(buf, off + 8).ok()?;
        if st_value == 0 {
            continue;
        }
        if let Ok(name) = section_name(buf, table.str_off, st_name) {
            if name == symbol {
                return Some(st_value);
            }
        }
    }
    None
}

impl SymbolLookup for ElfSymbols {
    fn resolve(&self, symbol: &str, image: Option<&str>) -> Result<usize, ResolveError> {
        let modules = process_modules()?;
        for module in &modules {
            if let Some(filter) = image {
                if !module.path.contains(filter) {
                    continue;
                }
            }

            let map = match FileMap::open(&module.path) {
                Ok(map) => map,
                Err(err) => {
                    debug!("cannot map {}: {err}", module.path);
                    continue;
                }
            };
            let parsed = match ElfImage::parse(map.bytes(), map.addr()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("cannot parse {}: {err}", module.path);
                    continue;
                }
            };

            if let Some(value) = parsed.lookup(map.bytes(), symbol) {
                let addr = (value as usize)
                    .wrapping_add(module.base)
                    .wrapping_sub(map.addr().wrapping_sub(parsed.load_bias));
                return Ok(addr);
            }
        }
        Err(ResolveError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_line_rejects_non_modules() {
        // Wrong permissions.
        assert!(
            parse_maps_line("7f0000000000-7f0000001000 rw-p 00000000 08:01 12345 /usr/lib/x.so")
                .unwrap()
                .is_none()
        );
        // Pseudo paths.
        assert!(
            parse_maps_line("7ffc00000000-7ffc00001000 r-xp 00000000 00:00 0 [vdso]")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_maps_line_malformed() {
        assert_eq!(
            parse_maps_line("not a maps line").unwrap_err(),
            ResolveError::UnexpectedFormat
        );
    }

    #[test]
    fn test_resolve_open_matches_dynamic_linker() {
        let addr = resolve_reference("open");
        let resolved = ElfSymbols
            .resolve("open", Some("libc"))
            .expect("open must resolve in libc");
        assert_eq!(resolved, addr);
    }

    #[test]
    fn test_resolve_unknown_symbol() {
        assert_eq!(
            ElfSymbols.resolve("graft_no_such_symbol_xyzzy", None),
            Err(ResolveError::NotFound)
        );
    }

    #[test]
    fn test_resolve_with_wrong_image_filter() {
        assert_eq!(
            ElfSymbols.resolve("open", Some("no-such-image")),
            Err(ResolveError::NotFound)
        );
    }

    /// Reference address from the dynamic linker itself.
    fn resolve_reference(symbol: &str) -> usize {
        let name = std::ffi::CString::new(symbol).unwrap();
        // SAFETY: dlsym with a NUL-terminated name and the default scope.
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        assert!(!addr.is_null());
        addr as usize
    }
}
