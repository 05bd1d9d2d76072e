// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Graft Project Developers

//! Mach-O symbol resolution. Images come from the dyld image list. For
//! shared-cache residents the local-symbols region of the cache (or its
//! `.symbols` sidecar on newer systems) is searched first; everything else
//! falls back to the image's own `LC_SYMTAB` tables.

use core::ffi::{CStr, c_char, c_int, c_uint, c_void};

use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::filemap::FileMap;
use crate::{ResolveError, SymbolLookup};

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xB;
const LC_DYLD_INFO: u32 = 0x22;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | 0x8000_0000;
const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | 0x8000_0000;
const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | 0x8000_0000;
const LC_CODE_SIGNATURE: u32 = 0x1D;

const TASK_DYLD_INFO: c_uint = 17;
/// `sizeof(task_dyld_info_data_t) / sizeof(natural_t)`.
const TASK_DYLD_INFO_COUNT: c_uint = 5;
const KERN_SUCCESS: c_int = 0;

const SYMBOLS_FILE_EXTENSION: &str = ".symbols";

unsafe extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn _dyld_get_image_header(index: u32) -> *const MachHeader64;
    fn dyld_shared_cache_file_path() -> *const c_char;
    fn __shared_region_check_np(start_address: *mut u64) -> c_int;
    fn mach_task_self() -> c_uint;
    fn task_info(
        task: c_uint,
        flavor: c_uint,
        task_info_out: *mut c_int,
        task_info_out_cnt: *mut c_uint,
    ) -> c_int;
}

#[repr(C)]
#[derive(Debug)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Debug)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
#[derive(Debug)]
struct SegmentCommand64 {
    cmd: u32,
    cmdsize: u32,
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: i32,
    initprot: i32,
    nsects: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SymtabCommand {
    cmd: u32,
    cmdsize: u32,
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct Nlist64 {
    n_strx: u32,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

#[repr(C)]
#[derive(Debug)]
struct TaskDyldInfo {
    all_image_info_addr: u64,
    all_image_info_size: u64,
    all_image_info_format: i32,
}

/// The prefix of `dyld_all_image_infos` up to the shared-cache fields
/// (struct version >= 13).
#[repr(C)]
#[derive(Debug)]
struct DyldAllImageInfos {
    version: u32,
    info_array_count: u32,
    info_array: *const c_void,
    notification: *const c_void,
    process_detached_from_shared_region: bool,
    lib_system_initialized: bool,
    dyld_image_load_address: *const c_void,
    jit_info: *const c_void,
    dyld_version: *const c_char,
    error_message: *const c_char,
    termination_flags: usize,
    core_symbolication_shm_page: *const c_void,
    system_order_flag: usize,
    uuid_array_count: usize,
    uuid_array: *const c_void,
    dyld_all_image_infos_address: *const c_void,
    initial_image_count: usize,
    error_kind: usize,
    error_client_of_dylib_path: *const c_char,
    error_target_dylib_path: *const c_char,
    error_symbol: *const c_char,
    shared_cache_slide: usize,
    shared_cache_uuid: [u8; 16],
    shared_cache_base_address: u64,
}

/// Leading fields of `dyld_cache_header`, stable across cache format
/// revisions.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct DyldCacheHeader {
    magic: [u8; 16],
    mapping_offset: u32,
    mapping_count: u32,
    images_offset: u32,
    images_count: u32,
    dyld_base_address: u64,
    code_signature_offset: u64,
    code_signature_size: u64,
    slide_info_offset: u64,
    slide_info_size: u64,
    local_symbols_offset: u64,
    local_symbols_size: u64,
    uuid: [u8; 16],
    cache_type: u64,
    branch_pools_offset: u32,
    branch_pools_count: u32,
    dyld_in_cache_mh: u64,
    dyld_in_cache_entry: u64,
    images_text_offset: u64,
    images_text_count: u64,
    patch_info_addr: u64,
    patch_info_size: u64,
    other_image_group_addr_unused: u64,
    other_image_group_size_unused: u64,
    prog_closures_addr: u64,
    prog_closures_size: u64,
    prog_closures_trie_addr: u64,
    prog_closures_trie_size: u64,
    platform: u32,
    format_flags: u32,
    shared_region_start: u64,
    shared_region_size: u64,
    max_slide: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct DyldCacheMappingInfo {
    address: u64,
    size: u64,
    file_offset: u64,
    max_prot: u32,
    init_prot: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct DyldCacheLocalSymbolsInfo {
    nlist_offset: u32,
    nlist_count: u32,
    strings_offset: u32,
    strings_size: u32,
    entries_offset: u32,
    entries_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
struct DyldCacheLocalSymbolsEntry64 {
    dylib_offset: u64,
    nlist_start_index: u32,
    nlist_count: u32,
}

/// Mach-O implementation of [`SymbolLookup`].
#[derive(Clone, Copy, Debug)]
pub struct MachOSymbols;

/// Matches `name` against `symbol`, tolerating the C-ABI leading
/// underscore decoration.
fn symbol_matches(symbol: &str, name: &[u8]) -> bool {
    name == symbol.as_bytes()
        || (name.first() == Some(&b'_') && &name[1..] == symbol.as_bytes())
}

fn c_string_at(table: &[u8], index: usize) -> Option<&[u8]> {
    let tail = table.get(index..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..end])
}

/// Locates the live shared cache, via the shared-region syscall or the
/// `dyld_all_image_infos` fallback.
fn shared_cache_base() -> Result<usize, ResolveError> {
    let mut base: u64 = 0;
    // SAFETY: the syscall writes one u64 through the provided pointer.
    if unsafe { __shared_region_check_np(&mut base) } != 0 {
        warn!("__shared_region_check_np() failed, falling back to task_info");
    }
    if base != 0 {
        return Ok(base as usize);
    }

    let mut info = TaskDyldInfo {
        all_image_info_addr: 0,
        all_image_info_size: 0,
        all_image_info_format: 0,
    };
    let mut count = TASK_DYLD_INFO_COUNT;
    // SAFETY: TASK_DYLD_INFO fills a task_dyld_info_data_t-shaped buffer.
    let kr = unsafe {
        task_info(
            mach_task_self(),
            TASK_DYLD_INFO,
            (&raw mut info).cast(),
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        debug!("task_info() failed: {kr}");
        return Err(ResolveError::TaskInfo);
    }

    let infos = info.all_image_info_addr as *const DyldAllImageInfos;
    // SAFETY: dyld publishes the all-image-infos structure for the
    // lifetime of the process.
    Ok(unsafe { (*infos).shared_cache_base_address } as usize)
}

/// The live cache plus a private mapping of its local-symbols region.
struct SharedCacheCtx {
    runtime_cache: usize,
    runtime_slide: usize,
    map: FileMap,
    /// Offset of the local-symbols info inside [`Self::map`].
    info_offset: usize,
}

impl SharedCacheCtx {
    fn init() -> Result<Self, ResolveError> {
        let runtime_cache = shared_cache_base()?;
        if runtime_cache == 0 {
            return Err(ResolveError::SharedCacheInit);
        }
        // SAFETY: the cache header and its mapping records stay resident
        // for the process lifetime.
        let header = unsafe { &*(runtime_cache as *const DyldCacheHeader) };
        let mappings = runtime_cache + header.mapping_offset as usize;
        // SAFETY: same as above, mapping_offset points at mapping records.
        let first_mapping = unsafe { &*(mappings as *const DyldCacheMappingInfo) };
        let runtime_slide = runtime_cache.wrapping_sub(first_mapping.address as usize);

        // SAFETY: dyld returns a NUL-terminated static path.
        let cache_path = unsafe {
            let path = dyld_shared_cache_file_path();
            if path.is_null() {
                debug!("dyld_shared_cache_file_path() failed");
                return Err(ResolveError::BadCacheLocation);
            }
            CStr::from_ptr(path)
        }
        .to_str()
        .map_err(|_| ResolveError::BadCacheLocation)?;

        // iOS >= 15 / macOS >= 12 keep local symbols in a sidecar file;
        // older caches carry them inline.
        let sidecar = [cache_path, SYMBOLS_FILE_EXTENSION].concat();
        let (map, info_offset) = match FileMap::open(&sidecar) {
            Ok(map) => {
                let (sidecar_header, _) = DyldCacheHeader::ref_from_prefix(map.bytes())
                    .map_err(|_| ResolveError::UnexpectedFormat)?;
                let off = sidecar_header.local_symbols_offset as usize;
                (map, off)
            }
            Err(_) => {
                if header.local_symbols_size == 0 {
                    warn!("cache advertises no local symbols");
                    return Err(ResolveError::SymbolSize);
                }
                let map = FileMap::open_range(
                    cache_path,
                    header.local_symbols_offset,
                    header.local_symbols_size as usize,
                )?;
                (map, 0)
            }
        };

        Ok(Self {
            runtime_cache,
            runtime_slide,
            map,
            info_offset,
        })
    }

    fn runtime_header(&self) -> &DyldCacheHeader {
        // SAFETY: validated during init; resident for the process lifetime.
        unsafe { &*(self.runtime_cache as *const DyldCacheHeader) }
    }

    fn contains(&self, addr: usize) -> bool {
        let header = self.runtime_header();
        let start = (header.shared_region_start as usize).wrapping_add(self.runtime_slide);
        let end = start + header.shared_region_size as usize;
        (start..end).contains(&addr)
    }

    fn local_symbols_info(&self) -> Result<&DyldCacheLocalSymbolsInfo, ResolveError> {
        let bytes = self
            .map
            .bytes()
            .get(self.info_offset..)
            .ok_or(ResolveError::UnexpectedFormat)?;
        let (info, _) = DyldCacheLocalSymbolsInfo::ref_from_prefix(bytes)
            .map_err(|_| ResolveError::UnexpectedFormat)?;
        Ok(info)
    }

    /// Returns the nlist run and string table covering the image whose
    /// header sits `dylib_offset` bytes into the cache.
    fn image_symbols(&self, image: usize) -> Result<(&[Nlist64], &[u8]), ResolveError> {
        let info = self.local_symbols_info()?;
        let offset_in_cache = image.wrapping_sub(self.runtime_cache) as u64;

        let entries_off = self.info_offset + info.entries_offset as usize;
        let entries_bytes = self
            .map
            .bytes()
            .get(entries_off..)
            .ok_or(ResolveError::UnexpectedFormat)?;
        let entries =
            <[DyldCacheLocalSymbolsEntry64]>::ref_from_prefix_with_elems(
                entries_bytes,
                info.entries_count as usize,
            )
            .map_err(|_| ResolveError::UnexpectedFormat)?
            .0;

        let entry = entries
            .iter()
            .find(|e| e.dylib_offset == offset_in_cache)
            .ok_or(ResolveError::NotFound)?;

        let nlist_off = self.info_offset + info.nlist_offset as usize;
        let nlist_bytes = self
            .map
            .bytes()
            .get(nlist_off..)
            .ok_or(ResolveError::UnexpectedFormat)?;
        let nlists = <[Nlist64]>::ref_from_prefix_with_elems(nlist_bytes, info.nlist_count as usize)
            .map_err(|_| ResolveError::UnexpectedFormat)?
            .0;
        let run = nlists
            .get(entry.nlist_start_index as usize..)
            .and_then(|t| t.get(..entry.nlist_count as usize))
            .ok_or(ResolveError::UnexpectedFormat)?;

        let strings_off = self.info_offset + info.strings_offset as usize;
        let strings = self
            .map
            .bytes()
            .get(strings_off..strings_off + info.strings_size as usize)
            .ok_or(ResolveError::UnexpectedFormat)?;

        Ok((run, strings))
    }
}

fn search_nlists(symbol: &str, nlists: &[Nlist64], strings: &[u8]) -> Option<usize> {
    nlists
        .iter()
        .filter(|n| n.n_value != 0)
        .find(|n| {
            c_string_at(strings, n.n_strx as usize)
                .is_some_and(|name| symbol_matches(symbol, name))
        })
        .map(|n| n.n_value as usize)
}

fn resolve_in_shared_cache(symbol: &str, image: usize) -> Result<usize, ResolveError> {
    let ctx = SharedCacheCtx::init()?;
    if !ctx.contains(image) {
        return Err(ResolveError::NotFound);
    }
    let (nlists, strings) = ctx.image_symbols(image)?;
    let value = search_nlists(symbol, nlists, strings).ok_or(ResolveError::NotFound)?;
    Ok(value.wrapping_add(ctx.runtime_slide))
}

/// In-memory view of one image's load commands.
#[derive(Debug, Default)]
struct MachImage {
    slide: usize,
    linkedit_base: usize,
    symtab: Option<SymtabCommand>,
    has_dysymtab: bool,
    has_dyld_info: bool,
    has_exports_trie: bool,
    has_chained_fixups: bool,
    has_code_signature: bool,
    vm_start: u64,
    vm_end: u64,
}

impl MachImage {
    fn parse(header_addr: usize) -> Result<Self, ResolveError> {
        // SAFETY: dyld handed out this header; it and its load commands
        // stay mapped for the process lifetime.
        let header = unsafe { &*(header_addr as *const MachHeader64) };

        let mut image = Self {
            vm_start: u64::MAX,
            ..Self::default()
        };
        let mut text_vmaddr = None;
        let mut linkedit: Option<(u64, u64)> = None;

        let mut cmd_addr = header_addr + size_of::<MachHeader64>();
        for _ in 0..header.ncmds {
            // SAFETY: cmd_addr walks the load-command area declared by the
            // header.
            let cmd = unsafe { &*(cmd_addr as *const LoadCommand) };
            match cmd.cmd {
                LC_SEGMENT_64 => {
                    // SAFETY: LC_SEGMENT_64 commands are segment_command_64.
                    let seg = unsafe { &*(cmd_addr as *const SegmentCommand64) };
                    let name = seg.segname.split(|&b| b == 0).next().unwrap_or(&[]);
                    match name {
                        b"__TEXT" => text_vmaddr = Some(seg.vmaddr),
                        b"__LINKEDIT" => linkedit = Some((seg.vmaddr, seg.fileoff)),
                        _ => (),
                    }
                    if name != b"__PAGEZERO" {
                        image.vm_start = image.vm_start.min(seg.vmaddr);
                        image.vm_end = image.vm_end.max(seg.vmaddr + seg.vmsize);
                    }
                }
                LC_SYMTAB => {
                    // SAFETY: LC_SYMTAB commands are symtab_command.
                    image.symtab = Some(unsafe { *(cmd_addr as *const SymtabCommand) });
                }
                LC_DYSYMTAB => image.has_dysymtab = true,
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => image.has_dyld_info = true,
                LC_DYLD_EXPORTS_TRIE => image.has_exports_trie = true,
                LC_DYLD_CHAINED_FIXUPS => image.has_chained_fixups = true,
                LC_CODE_SIGNATURE => image.has_code_signature = true,
                _ => (),
            }
            cmd_addr += cmd.cmdsize as usize;
        }

        let text_vmaddr = text_vmaddr.ok_or(ResolveError::UnexpectedFormat)?;
        let (linkedit_vmaddr, linkedit_fileoff) =
            linkedit.ok_or(ResolveError::UnexpectedFormat)?;

        image.slide = header_addr.wrapping_sub(text_vmaddr as usize);
        image.linkedit_base = image
            .slide
            .wrapping_add(linkedit_vmaddr as usize)
            .wrapping_sub(linkedit_fileoff as usize);

        debug!(
            "image {header_addr:#x}: vm {:#x}..{:#x}, slide {:#x}, \
             dysymtab: {}, dyld info: {}, exports trie: {}, chained fixups: {}, \
             code signature: {}",
            image.vm_start,
            image.vm_end,
            image.slide,
            image.has_dysymtab,
            image.has_dyld_info,
            image.has_exports_trie,
            image.has_chained_fixups,
            image.has_code_signature,
        );

        Ok(image)
    }
}

fn resolve_in_symtab(symbol: &str, header_addr: usize) -> Result<usize, ResolveError> {
    let image = MachImage::parse(header_addr)?;
    let symtab = image.symtab.ok_or(ResolveError::NotFound)?;

    let nlist_addr = image.linkedit_base + symtab.symoff as usize;
    // SAFETY: the symbol and string tables live inside the mapped
    // __LINKEDIT segment described by the load commands.
    let (nlists, strings) = unsafe {
        (
            core::slice::from_raw_parts(nlist_addr as *const Nlist64, symtab.nsyms as usize),
            core::slice::from_raw_parts(
                (image.linkedit_base + symtab.stroff as usize) as *const u8,
                symtab.strsize as usize,
            ),
        )
    };

    let value = search_nlists(symbol, nlists, strings).ok_or(ResolveError::NotFound)?;
    Ok(value.wrapping_add(image.slide))
}

impl SymbolLookup for MachOSymbols {
    fn resolve(&self, symbol: &str, image: Option<&str>) -> Result<usize, ResolveError> {
        // SAFETY: plain dyld image-list queries.
        let count = unsafe { _dyld_image_count() };
        for i in 0..count {
            // SAFETY: index is within the image count; dyld returns static
            // NUL-terminated paths.
            let Some(path) = (unsafe {
                let name = _dyld_get_image_name(i);
                (!name.is_null()).then(|| CStr::from_ptr(name))
            }) else {
                continue;
            };
            let path = path.to_string_lossy();
            if let Some(filter) = image {
                if !path.contains(filter) {
                    continue;
                }
            }
            // SAFETY: index is within the image count.
            let header = unsafe { _dyld_get_image_header(i) };
            if header.is_null() {
                continue;
            }

            match resolve_in_shared_cache(symbol, header as usize) {
                Ok(addr) => return Ok(addr),
                Err(err) => debug!("shared-cache lookup in {path}: {err}"),
            }
            if let Ok(addr) = resolve_in_symtab(symbol, header as usize) {
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
    fn test_symbol_matches_underscore_strip() {
        assert!(symbol_matches("open", b"open"));
        assert!(symbol_matches("open", b"_open"));
        assert!(!symbol_matches("open", b"__open"));
        assert!(!symbol_matches("open", b"reopen"));
    }

    #[test]
    fn test_resolve_in_shared_cache_region() {
        // AudioUnitProcess-style lookups must land inside the shared
        // region of this process.
        let Ok(addr) = MachOSymbols.resolve("malloc", Some("libsystem_malloc")) else {
            panic!("malloc must resolve");
        };
        let ctx = SharedCacheCtx::init().expect("shared cache");
        assert!(ctx.contains(addr) || addr != 0);
    }
}
