use std::sync::Arc;

use recipemap::*;

mod common;

const BIAS: u64 = 0x7f00_0001_0000;
const STACK_BASE: u64 = 0x10000;

/// `a` at 0x1000 sets up a frame pointer, `b` at 0x1040 does not.
fn text() -> Vec<u8> {
    let mut text = vec![0xcc; 0x100];
    text[..8].copy_from_slice(&[0x55, 0x48, 0x89, 0xe5, 0x90, 0x90, 0x5d, 0xc3]);
    text[0x40..0x44].copy_from_slice(&[0x53, 0x48, 0x83, 0xc3]);
    text
}

fn module(name: &str, with_text: bool) -> Module<Vec<u8>> {
    let eh_frame = common::frame_pointer_eh_frame(&[(0x1000, 0x40), (0x1040, 0x40)]);
    let eh_frame_len = eh_frame.len() as u64;
    Module::new(
        name.into(),
        BIAS..BIAS + 0x3000,
        BIAS,
        0,
        ModuleSections {
            text_svma: with_text.then_some(0x1000..0x1100),
            text: with_text.then(text),
            eh_frame_svma: Some(0x2000..0x2000 + eh_frame_len),
            eh_frame: Some(eh_frame),
        },
    )
}

type Registry = Arc<ModuleRegistry<Vec<u8>>>;

fn setup(with_text: bool) -> (Registry, RecipeMap<RecipeX86_64, Registry, Registry>) {
    let registry = Arc::new(ModuleRegistry::new());
    let map = RecipeMap::new(registry.clone(), registry.clone());
    let mapping = registry.add_module(module("libtest.so", with_text));
    map.on_map(mapping);
    (registry, map)
}

#[test]
fn dwarf_recipes_from_eh_frame() {
    let (_registry, map) = setup(true);
    let mut cache = map.new_thread_cache();
    let recipe_at = |offset: u64, cache: &mut ThreadCache<RecipeX86_64>| {
        map.lookup(BIAS + offset, UnwinderKind::Dwarf, cache)
            .map(|h| h.recipe())
    };
    assert_eq!(
        recipe_at(0x1000, &mut cache),
        Ok(RecipeX86_64::OffsetSp { sp_offset_by_8: 1 })
    );
    assert_eq!(
        recipe_at(0x1003, &mut cache),
        Ok(RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: 0
        })
    );
    assert_eq!(recipe_at(0x103f, &mut cache), Ok(RecipeX86_64::UseFramePointer));
    assert_eq!(recipe_at(0x1044, &mut cache), Ok(RecipeX86_64::UseFramePointer));

    let handle = map
        .lookup(BIAS + 0x1010, UnwinderKind::Dwarf, &mut cache)
        .unwrap();
    assert_eq!(
        handle.function_interval(),
        Interval::new(BIAS + 0x1000, BIAS + 0x1040)
    );
    assert_eq!(handle.interval(), Interval::new(BIAS + 0x1004, BIAS + 0x1040));
}

#[test]
fn native_recipes_from_prologues() {
    let (_registry, map) = setup(true);
    let mut cache = map.new_thread_cache();
    let recipe_at = |offset: u64, cache: &mut ThreadCache<RecipeX86_64>| {
        map.lookup(BIAS + offset, UnwinderKind::Native, cache)
            .map(|h| h.recipe())
    };
    assert_eq!(recipe_at(0x1000, &mut cache), Ok(RecipeX86_64::JustReturn));
    assert_eq!(
        recipe_at(0x1001, &mut cache),
        Ok(RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: 0
        })
    );
    assert_eq!(recipe_at(0x1006, &mut cache), Ok(RecipeX86_64::UseFramePointer));
    assert_eq!(
        recipe_at(0x1050, &mut cache),
        Ok(RecipeX86_64::JustReturnIfFirstFrameOtherwiseFp)
    );
}

#[test]
fn addresses_without_fde_have_no_bounds() {
    let (_registry, map) = setup(true);
    let mut cache = map.new_thread_cache();
    let address = BIAS + 0x1100;
    assert_eq!(
        map.lookup(address, UnwinderKind::Dwarf, &mut cache).err(),
        Some(LookupError::NoFunctionBounds(address))
    );
    assert_eq!(
        map.lookup(BIAS - 1, UnwinderKind::Dwarf, &mut cache).err(),
        Some(LookupError::Unresolvable(BIAS - 1))
    );
}

#[test]
fn native_build_without_text_fails() {
    let (_registry, map) = setup(false);
    let mut cache = map.new_thread_cache();
    assert_eq!(
        map.lookup(BIAS + 0x1008, UnwinderKind::Native, &mut cache).err(),
        Some(LookupError::BuildFailed {
            start: BIAS + 0x1000,
            end: BIAS + 0x1040,
            source: BuildError::NoUnwindInfo
        })
    );
    assert!(map
        .lookup(BIAS + 0x1008, UnwinderKind::Dwarf, &mut cache)
        .is_ok());
}

#[test]
fn removed_module_becomes_unresolvable() {
    let (registry, map) = setup(true);
    let mut cache = map.new_thread_cache();
    map.lookup(BIAS + 0x1010, UnwinderKind::Dwarf, &mut cache)
        .unwrap();
    let mapping = registry.remove_module(BIAS).unwrap();
    map.on_unmap(mapping);
    assert!(registry.is_empty());
    assert_eq!(
        map.lookup(BIAS + 0x1010, UnwinderKind::Dwarf, &mut cache).err(),
        Some(LookupError::Unresolvable(BIAS + 0x1010))
    );
    assert_eq!(
        map.entries(UnwinderKind::Dwarf)
            .iter()
            .map(|e| e.interval)
            .collect::<Vec<_>>(),
        [Interval::EVERYTHING]
    );
}

#[test]
fn walk_stack_with_dwarf_recipes() {
    let (_registry, map) = setup(true);
    let mut cache = map.new_thread_cache();

    // b (no frame of its own) was called from a, which was called from a.
    let stack = [
        BIAS + 0x1020, // return address into a
        1,
        2,
        3,
        STACK_BASE + 0x40, // a's saved bp
        BIAS + 0x1030,     // return address into a
        4,
        5,
        0, // root frame's bp
        0, // no return address
    ];
    let mut read_stack = |addr: u64| {
        addr.checked_sub(STACK_BASE)
            .and_then(|offset| stack.get((offset / 8) as usize).copied())
            .ok_or(())
    };

    let mut regs = RegsX86_64::new(BIAS + 0x1050, STACK_BASE, STACK_BASE + 0x20);
    let mut frames = vec![regs.ip()];
    let mut is_first_frame = true;
    loop {
        // Return addresses point after the call; look up the call itself.
        let lookup_address = if is_first_frame { regs.ip() } else { regs.ip() - 1 };
        let recipe = match map.lookup(lookup_address, UnwinderKind::Native, &mut cache) {
            Ok(handle) => handle.recipe(),
            Err(_) => RecipeX86_64::UseFramePointer,
        };
        match recipe.unwind_step(is_first_frame, &mut regs, &mut read_stack) {
            Ok(Some(return_address)) => frames.push(return_address),
            Ok(None) => break,
            Err(err) => panic!("unwinding failed: {err}"),
        }
        is_first_frame = false;
    }
    assert_eq!(frames, [BIAS + 0x1050, BIAS + 0x1020, BIAS + 0x1030]);
}
