//! End-to-end: assemble a two-record table, persist it, reopen the cache in
//! a fresh instance, and unwind a synthetic register file through the
//! reloaded table.

use quickstep::quicken::Instruction;
use quickstep::{
    Arch, ImageRegistry, MapEntry, MapPerms, QuickenTable, RegisterFile, SliceMemory,
    StaticMaps, TableCache, UnwindCursor, Unwinder,
};

fn two_record_table(arch: Arch) -> QuickenTable {
    // Both ranges restore the return address from [sp+12] and set the stack
    // pointer to sp+16.
    let program = [
        Instruction::Load { dst: arch.ra(), src: arch.sp(), offset: 12 },
        Instruction::Add { reg: arch.sp(), offset: 16 },
    ];
    QuickenTable::from_programs(
        arch,
        &[(0x1000, 0x1040, &program[..]), (0x1040, 0x1080, &program[..])],
    )
    .unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn build_save_load_unwind() -> anyhow::Result<()> {
    init_logging();
    let arch = Arch::Arm;
    let dir = tempfile::tempdir()?;

    // One image mapped so its load bias is zero: relative pcs equal
    // absolute ones.
    let registry = ImageRegistry::new(Box::new(StaticMaps(vec![MapEntry {
        start: 0x1000,
        end: 0x2000,
        perms: MapPerms { read: true, exec: true },
        offset: 0x1000,
        path: "/lib/libtwo.so".to_string(),
    }])));
    registry.refresh().unwrap();
    let image = registry.find(0x1050).unwrap();

    // Save through one cache instance.
    {
        let cache = TableCache::new(dir.path())?;
        let table = two_record_table(arch);
        cache.save(&image.base_name, &image.content_hash, image.build_id(), &table)?;
    }

    // Reopen in a new cache instance; the table must come back from disk.
    let cache = TableCache::new(dir.path())?;
    assert!(cache.has_hash(&image.base_name, &image.content_hash));
    let reloaded = cache.load(&image)?;
    assert_eq!(*reloaded, two_record_table(arch));

    // Stack memory returns 0xdeadbeef at sp+12.
    let mut memory = SliceMemory::new();
    memory.add_word(0x7fff_000c, 0xdead_beef, arch);

    let mut regs = RegisterFile::new(arch);
    regs.set_pc(0x1050);
    regs.set_sp(0x7fff_0000);
    let mut cursor = UnwindCursor::new(regs);

    let unwinder = Unwinder::new(&registry, &cache, &memory);
    let result = unwinder.unwind(&mut cursor, &(0x7fff_0000..0x7fff_4000), 16);

    assert_eq!(result.frames[0].pc, 0x1050);
    assert_eq!(result.frames[0].rel_pc, 0x1050);
    assert_eq!(
        result.frames[0].image.as_ref().map(|i| i.path.as_str()),
        Some("/lib/libtwo.so")
    );
    assert_eq!(cursor.regs.pc(), 0xdead_beef);
    assert_eq!(cursor.regs.sp(), 0x7fff_0010);
    Ok(())
}

#[test]
fn unwind_walks_both_records() {
    init_logging();
    let arch = Arch::Arm;
    let dir = tempfile::tempdir().unwrap();

    let registry = ImageRegistry::new(Box::new(StaticMaps(vec![MapEntry {
        start: 0x1000,
        end: 0x2000,
        perms: MapPerms { read: true, exec: true },
        offset: 0x1000,
        path: "/lib/libchain.so".to_string(),
    }])));
    registry.refresh().unwrap();
    let image = registry.find(0x1050).unwrap();

    let cache = TableCache::new(dir.path()).unwrap();
    let table = two_record_table(arch);
    cache.save(&image.base_name, &image.content_hash, image.build_id(), &table).unwrap();

    // Two stacked frames: the first return address points back into the
    // first record's range, the second leaves the image.
    let mut memory = SliceMemory::new();
    memory.add_word(0x7fff_000c, 0x1020, arch);
    memory.add_word(0x7fff_001c, 0xdead_beef, arch);

    let mut regs = RegisterFile::new(arch);
    regs.set_pc(0x1050);
    regs.set_sp(0x7fff_0000);
    let mut cursor = UnwindCursor::new(regs);

    let unwinder = Unwinder::new(&registry, &cache, &memory);
    let result = unwinder.unwind(&mut cursor, &(0x7fff_0000..0x7fff_4000), 16);

    let pcs: Vec<u64> = result.frames.iter().map(|f| f.pc).collect();
    // Second frame is call-site adjusted (arm, even return address: -4).
    assert_eq!(pcs[0], 0x1050);
    assert_eq!(pcs[1], 0x101c);
    assert_eq!(cursor.regs.sp(), 0x7fff_0020);
}
