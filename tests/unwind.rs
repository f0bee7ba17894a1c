//! End-to-end unwinds over synthetic ELF images: a process memory view
//! is assembled by hand, the maps point into it, and the driver walks the
//! stack through the DWARF engine exactly as it would for a real target.

use std::io::Write as _;
use std::sync::Arc;

use framewalk::{
    offline, Arch, ErrorCode, Maps, Memory, MemoryOfflineBuffer, Regs, Unwinder,
};

const ELF_BASE: u64 = 0x10000;
const STACK_BASE: u64 = 0x20000;

const FUNC_A: u64 = 0x500; // covered by an FDE with the CIE's initial rules
const FUNC_B: u64 = 0x600; // pushes the CFA out to rsp + 16 after 8 bytes

fn push32(data: &mut Vec<u8>, value: u32) {
    data.extend_from_slice(&value.to_le_bytes());
}

fn push64(data: &mut Vec<u8>, value: u64) {
    data.extend_from_slice(&value.to_le_bytes());
}

/// CIE with CFA = sp + 8 and the return address register stored at
/// CFA - 8. `ra_reg` and `sp_reg` select the architecture's numbering.
fn build_cie(eh_frame: &mut Vec<u8>, ra_reg: u8, sp_reg: u8) {
    let start = eh_frame.len();
    push32(eh_frame, 0); // length placeholder
    push32(eh_frame, 0); // CIE id
    eh_frame.push(1); // version
    eh_frame.extend_from_slice(b"zR\0");
    eh_frame.push(1); // code alignment factor
    eh_frame.push(0x78); // data alignment factor: -8
    eh_frame.push(ra_reg);
    eh_frame.push(1); // augmentation data length
    eh_frame.push(0x00); // fde encoding: absptr
    // def_cfa sp, 8; offset ra_reg, 1
    eh_frame.extend_from_slice(&[0x0c, sp_reg, 0x08, 0x80 | ra_reg, 0x01]);
    finish_entry(eh_frame, start);
}

fn build_fde(eh_frame: &mut Vec<u8>, cie_offset: usize, pc_start: u64, pc_len: u64, instructions: &[u8]) -> usize {
    let start = eh_frame.len();
    push32(eh_frame, 0); // length placeholder
    let cie_pointer = (start + 4 - cie_offset) as u32;
    push32(eh_frame, cie_pointer);
    push64(eh_frame, pc_start);
    push64(eh_frame, pc_len);
    eh_frame.push(0); // augmentation data length
    eh_frame.extend_from_slice(instructions);
    finish_entry(eh_frame, start);
    start
}

fn finish_entry(eh_frame: &mut Vec<u8>, start: usize) {
    while (eh_frame.len() - start) % 4 != 0 {
        eh_frame.push(0x00); // DW_CFA_nop
    }
    let length = (eh_frame.len() - start - 4) as u32;
    eh_frame[start..start + 4].copy_from_slice(&length.to_le_bytes());
}

struct ImageLayout {
    machine: u16,
    ra_reg: u8,
    sp_reg: u8,
    /// (pc_start, pc_len, fde instructions)
    functions: Vec<(u64, u64, Vec<u8>)>,
    with_symbols: bool,
}

/// Assemble a little-endian ELF64 image: header, PT_LOAD and
/// PT_GNU_EH_FRAME program headers, `.eh_frame_hdr` at 0x100, the
/// `.eh_frame` after it, and optionally `.symtab`/`.strtab` section
/// headers naming `func_a` and `func_b`.
fn build_image(layout: &ImageLayout) -> Vec<u8> {
    const EH_HDR_OFF: usize = 0x100;
    const EH_FRAME_OFF: usize = 0x140;

    let mut eh_frame = Vec::new();
    build_cie(&mut eh_frame, layout.ra_reg, layout.sp_reg);
    let mut fde_offsets = Vec::new();
    for (pc_start, pc_len, instructions) in &layout.functions {
        fde_offsets.push(build_fde(&mut eh_frame, 0, *pc_start, *pc_len, instructions));
    }

    // .eh_frame_hdr: version, encodings, count, then the sorted
    // (pc, fde address) table, datarel to the header itself.
    let mut eh_frame_hdr = Vec::new();
    eh_frame_hdr.push(1);
    eh_frame_hdr.push(0xff); // eh_frame_ptr: omitted
    eh_frame_hdr.push(0x03); // fde count: udata4
    eh_frame_hdr.push(0x3b); // table: datarel | sdata4
    push32(&mut eh_frame_hdr, layout.functions.len() as u32);
    for ((pc_start, _, _), fde_offset) in layout.functions.iter().zip(&fde_offsets) {
        push32(&mut eh_frame_hdr, (pc_start - EH_HDR_OFF as u64) as u32);
        push32(
            &mut eh_frame_hdr,
            (EH_FRAME_OFF + fde_offset - EH_HDR_OFF) as u32,
        );
    }
    assert!(EH_HDR_OFF + eh_frame_hdr.len() <= EH_FRAME_OFF);

    let mut data = vec![0u8; 0x40];
    // e_ident
    data[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    data[4] = 2; // ELFCLASS64
    data[5] = 1; // ELFDATA2LSB
    data[6] = 1; // EV_CURRENT
    data[16..18].copy_from_slice(&3u16.to_le_bytes()); // e_type: ET_DYN
    data[18..20].copy_from_slice(&layout.machine.to_le_bytes());
    data[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    data[32..40].copy_from_slice(&0x40u64.to_le_bytes()); // e_phoff
    data[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    data[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    data[56..58].copy_from_slice(&2u16.to_le_bytes()); // e_phnum
    data[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize

    // PT_LOAD, offset 0, vaddr 0, r-x, covering the whole image.
    push32(&mut data, 1);
    push32(&mut data, 5);
    push64(&mut data, 0);
    push64(&mut data, 0);
    push64(&mut data, 0);
    push64(&mut data, 0x1000);
    push64(&mut data, 0x1000);
    push64(&mut data, 0x1000);
    // PT_GNU_EH_FRAME over the header table.
    push32(&mut data, 0x6474_e550);
    push32(&mut data, 4);
    push64(&mut data, EH_HDR_OFF as u64);
    push64(&mut data, EH_HDR_OFF as u64);
    push64(&mut data, EH_HDR_OFF as u64);
    push64(&mut data, eh_frame_hdr.len() as u64);
    push64(&mut data, eh_frame_hdr.len() as u64);
    push64(&mut data, 4);

    data.resize(EH_HDR_OFF, 0);
    data.extend_from_slice(&eh_frame_hdr);
    data.resize(EH_FRAME_OFF, 0);
    data.extend_from_slice(&eh_frame);

    if layout.with_symbols {
        let strtab_off = data.len();
        let strtab = b"\0func_a\0func_b\0";
        data.extend_from_slice(strtab);

        let symtab_off = data.len();
        let mut sym = Vec::new();
        // Null symbol, then the two functions.
        sym.extend_from_slice(&[0u8; 24]);
        for (name_off, value, size) in [(1u32, FUNC_A, 0x20u64), (8, FUNC_B, 0x40)] {
            push32(&mut sym, name_off);
            sym.push(0x12); // STB_GLOBAL | STT_FUNC
            sym.push(0);
            sym.extend_from_slice(&1u16.to_le_bytes());
            push64(&mut sym, value);
            push64(&mut sym, size);
        }
        data.extend_from_slice(&sym);

        let shstrtab_off = data.len();
        let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0";
        data.extend_from_slice(&shstrtab[..]);

        while data.len() % 8 != 0 {
            data.push(0);
        }
        let shoff = data.len();
        let push_shdr = |data: &mut Vec<u8>,
                         name: u32,
                         sh_type: u32,
                         offset: usize,
                         size: usize,
                         link: u32,
                         entsize: u64| {
            push32(data, name);
            push32(data, sh_type);
            push64(data, 0); // flags
            push64(data, 0); // addr
            push64(data, offset as u64);
            push64(data, size as u64);
            push32(data, link);
            push32(data, 0); // info
            push64(data, 8); // addralign
            push64(data, entsize);
        };
        push_shdr(&mut data, 0, 0, 0, 0, 0, 0);
        push_shdr(&mut data, 1, 2, symtab_off, 3 * 24, 2, 24); // .symtab -> .strtab
        push_shdr(&mut data, 9, 3, strtab_off, strtab.len(), 0, 0); // .strtab
        push_shdr(&mut data, 17, 3, shstrtab_off, shstrtab.len(), 0, 0); // .shstrtab

        data[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        data[60..62].copy_from_slice(&4u16.to_le_bytes()); // e_shnum
        data[62..64].copy_from_slice(&3u16.to_le_bytes()); // e_shstrndx
    }

    data.resize(0x1000, 0);
    data
}

fn x86_64_image() -> Vec<u8> {
    build_image(&ImageLayout {
        machine: 62, // EM_X86_64
        ra_reg: 16,
        sp_reg: 7,
        functions: vec![
            (FUNC_A, 0x20, Vec::new()),
            // advance_loc 8; def_cfa_offset 16
            (FUNC_B, 0x40, vec![0x48, 0x0e, 0x10]),
        ],
        with_symbols: true,
    })
}

/// Process memory: the image mapped at ELF_BASE, a stack at STACK_BASE.
fn process_memory(image: Vec<u8>, stack_words: &[(u64, u64)]) -> Arc<dyn Memory> {
    let mut data = vec![0u8; (STACK_BASE - ELF_BASE) as usize + 0x100];
    data[..image.len()].copy_from_slice(&image);
    for (addr, value) in stack_words {
        let offset = (addr - ELF_BASE) as usize;
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
    Arc::new(MemoryOfflineBuffer::new(data, ELF_BASE))
}

fn test_maps() -> Maps {
    Maps::parse("10000-11000 r-xp 00000000 00:00 0 /fake/libtest.so\n").unwrap()
}

fn x86_64_regs(pc: u64, sp: u64) -> Regs {
    let mut regs = Regs::new(Arch::X86_64);
    regs.set(framewalk::x86_64::X86_64_REG_PC, pc);
    regs.set(framewalk::x86_64::X86_64_REG_SP, sp);
    regs
}

/// func_a was called by func_b: the return address into func_b sits on
/// the stack, and func_b's own return address slot holds zero, ending
/// the walk.
fn x86_64_scenario() -> (Maps, Regs, Arc<dyn Memory>) {
    let memory = process_memory(
        x86_64_image(),
        &[
            (STACK_BASE, ELF_BASE + FUNC_B + 0x10),
            (STACK_BASE + 0x10, 0),
        ],
    );
    (test_maps(), x86_64_regs(ELF_BASE + FUNC_A + 8, STACK_BASE), memory)
}

#[test]
fn walks_two_frames_with_symbols() {
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    unwinder.unwind(None, None);

    assert_eq!(unwinder.last_error().code, ErrorCode::None);
    assert_eq!(unwinder.num_frames(), 2);
    let frames = unwinder.frames();
    assert_eq!(frames[0].pc, ELF_BASE + FUNC_A + 8);
    assert_eq!(frames[0].sp, STACK_BASE);
    assert_eq!(frames[0].rel_pc, FUNC_A + 8);
    // The return address is backed up by one byte for the lookup.
    assert_eq!(frames[1].pc, ELF_BASE + FUNC_B + 0x10 - 1);
    assert_eq!(frames[1].sp, STACK_BASE + 8);

    assert_eq!(frames[0].function_name.as_ref().unwrap().as_str(), "func_a");
    assert_eq!(frames[0].function_offset, 8);
    assert_eq!(frames[1].function_name.as_ref().unwrap().as_str(), "func_b");

    assert_eq!(
        unwinder.format_frame(0),
        "  #00 pc 0000000000000508  libtest.so (func_a+8)"
    );
    assert_eq!(
        unwinder.format_frame(1),
        "  #01 pc 000000000000060f  libtest.so (func_b+15)"
    );
}

#[test]
fn rerunning_on_cloned_registers_is_identical() {
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(64, &maps, regs.clone(), memory);
    unwinder.unwind(None, None);
    let first: Vec<(u64, u64)> = unwinder.frames().iter().map(|f| (f.pc, f.sp)).collect();

    for _ in 0..3 {
        unwinder.set_regs(regs.clone());
        unwinder.unwind(None, None);
        let again: Vec<(u64, u64)> = unwinder.frames().iter().map(|f| (f.pc, f.sp)).collect();
        assert_eq!(first, again);
    }
}

#[test]
fn stack_pointer_never_decreases() {
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    unwinder.unwind(None, None);
    let frames = unwinder.frames();
    for pair in frames.windows(2) {
        assert!(pair[1].sp >= pair[0].sp);
    }
}

#[test]
fn pc_outside_any_map_terminates_with_invalid_map() {
    let (maps, _, memory) = x86_64_scenario();
    let regs = x86_64_regs(0x9999_9999, STACK_BASE);
    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    unwinder.unwind(None, None);

    assert_eq!(unwinder.last_error().code, ErrorCode::InvalidMap);
    assert_eq!(unwinder.last_error().address, 0x9999_9999);
    assert_eq!(unwinder.num_frames(), 1);
    assert_eq!(unwinder.frames()[0].pc, 0x9999_9999);
    assert_eq!(
        unwinder.format_frame(0),
        "  #00 pc 0000000099999999  <unknown>"
    );
}

#[test]
fn frame_cap_stops_the_walk() {
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(1, &maps, regs, memory);
    unwinder.unwind(None, None);
    assert_eq!(unwinder.num_frames(), 1);
    assert_eq!(unwinder.last_error().code, ErrorCode::MaxFrames);
}

#[test]
fn initial_map_name_skip_hides_frames_in_that_library() {
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    // Leading frames inside the named library (e.g. the sampler itself)
    // are suppressed; here the whole stack lives in it.
    unwinder.unwind(Some(&["libtest.so"]), None);
    assert_eq!(unwinder.num_frames(), 0);
    // A non-matching skip list leaves the frames alone.
    let (maps, regs, memory) = x86_64_scenario();
    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    unwinder.unwind(Some(&["libsampler.so"]), None);
    assert_eq!(unwinder.num_frames(), 2);
}

#[test]
fn lr_fallback_recovers_the_outermost_caller() {
    // arm64 image where only func_b has unwind info; the frame in func_a
    // can only be unwound through the link register, once.
    let image = build_image(&ImageLayout {
        machine: 183, // EM_AARCH64
        ra_reg: 30,
        sp_reg: 31,
        functions: vec![(FUNC_B, 0x40, Vec::new())],
        with_symbols: false,
    });
    let memory = process_memory(image, &[(STACK_BASE, 0)]);
    let maps = test_maps();
    let mut regs = Regs::new(Arch::Arm64);
    regs.set(framewalk::arm64::ARM64_REG_PC, ELF_BASE + FUNC_A + 8);
    regs.set(framewalk::arm64::ARM64_REG_SP, STACK_BASE);
    regs.set(framewalk::arm64::ARM64_REG_LR, ELF_BASE + FUNC_B + 0x10);

    let mut unwinder = Unwinder::new(64, &maps, regs, memory);
    unwinder.unwind(None, None);

    let frames = unwinder.frames();
    assert_eq!(frames.len(), 2, "{}", unwinder.format_frames());
    assert_eq!(frames[0].pc, ELF_BASE + FUNC_A + 8);
    // The LR fallback lands in func_b, where the zero return address
    // slot ends the walk.
    assert_eq!(frames[1].pc, ELF_BASE + FUNC_B + 0x10 - 4);
}

#[test]
fn concurrent_elf_materialization_yields_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("libtest.so");
    std::fs::write(&path, x86_64_image()).unwrap();

    let maps = Maps::parse(&format!(
        "10000-11000 r-xp 00000000 00:00 0 {}\n",
        path.display()
    ))
    .unwrap();
    let memory: Arc<dyn Memory> = Arc::new(MemoryOfflineBuffer::new(Vec::new(), 0));

    let elfs: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let maps = &maps;
                let memory = &memory;
                scope.spawn(move || maps.get_elf(0, Some(memory), Arch::X86_64))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(elfs[0].valid());
    for elf in &elfs {
        assert!(Arc::ptr_eq(elf, &elfs[0]));
    }
}

#[test]
fn offline_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let elf_path = dir.path().join("libtest.so");
    std::fs::write(&elf_path, x86_64_image()).unwrap();

    std::fs::write(
        dir.path().join("maps.txt"),
        format!("10000-11000 r-xp 00000000 00:00 0 {}\n", elf_path.display()),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("regs.txt"),
        format!(
            "rip: {:x}\nrsp: {:x}\n",
            ELF_BASE + FUNC_A + 8,
            STACK_BASE
        ),
    )
    .unwrap();
    let mut stack = std::fs::File::create(dir.path().join("stack.data")).unwrap();
    stack.write_all(&STACK_BASE.to_le_bytes()).unwrap();
    let mut stack_bytes = vec![0u8; 0x100];
    stack_bytes[..8].copy_from_slice(&(ELF_BASE + FUNC_B + 0x10).to_le_bytes());
    // The slot at STACK_BASE + 0x10 stays zero and ends the walk.
    stack.write_all(&stack_bytes).unwrap();
    drop(stack);

    let snapshot = offline::OfflineSnapshot::load(dir.path(), Arch::X86_64).unwrap();
    let mut unwinder = Unwinder::new(
        64,
        &snapshot.maps,
        snapshot.regs,
        snapshot.process_memory.clone(),
    );
    unwinder.unwind(None, None);

    assert_eq!(unwinder.last_error().code, ErrorCode::None);
    assert_eq!(unwinder.num_frames(), 2, "{}", unwinder.format_frames());
    assert_eq!(unwinder.frames()[0].rel_pc, FUNC_A + 8);
    assert_eq!(unwinder.frames()[1].rel_pc, FUNC_B + 0x10 - 1);
    assert_eq!(
        unwinder.format_frame(0),
        "  #00 pc 0000000000000508  libtest.so (func_a+8)"
    );
}
