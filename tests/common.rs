use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EndianVec, FrameDescriptionEntry,
    FrameTable,
};
use gimli::{LittleEndian, X86_64};
use recipemap::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestRecipe(pub u64);

impl Recipe for TestRecipe {
    fn fallback() -> Self {
        TestRecipe(0)
    }
}

pub const FUNCTION_SIZE: u64 = 0x100;

/// Every `FUNCTION_SIZE`-aligned block in `[0x1000, 0x100000)` is one
/// function, belonging to module `module` (1 unless changed).
pub struct BlockOracle {
    pub calls: AtomicUsize,
    pub module: AtomicU64,
}

impl Default for BlockOracle {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            module: AtomicU64::new(1),
        }
    }
}

impl FunctionBoundsOracle for BlockOracle {
    fn function_bounds(&self, address: u64) -> Option<FunctionBounds> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !(0x1000..0x100000).contains(&address) {
            return None;
        }
        let start = address & !(FUNCTION_SIZE - 1);
        Some(FunctionBounds {
            start,
            end: start + FUNCTION_SIZE,
            module: Some(ModuleToken(self.module.load(Ordering::SeqCst))),
        })
    }
}

/// Emits four equal recipes per function, each carrying its start address.
#[derive(Default)]
pub struct QuarterBuilder {
    pub builds: Mutex<HashMap<(u64, UnwinderKind), usize>>,
    /// How long each build takes, to widen race windows.
    pub delay: Option<Duration>,
    /// Functions whose build panics.
    pub panic_at: Option<u64>,
    /// Functions whose build returns an error.
    pub fail_at: Option<u64>,
}

impl QuarterBuilder {
    pub fn builds_of(&self, start: u64, kind: UnwinderKind) -> usize {
        let builds = self.builds.lock().unwrap();
        builds.get(&(start, kind)).copied().unwrap_or(0)
    }

    pub fn total_builds(&self) -> usize {
        self.builds.lock().unwrap().values().sum()
    }
}

impl IntervalBuilder<TestRecipe> for QuarterBuilder {
    fn build_intervals(
        &self,
        request: &BuildRequest,
        sink: &mut RecipeSink<'_, TestRecipe>,
    ) -> Result<(), BuildError> {
        let function = request.function;
        *self
            .builds
            .lock()
            .unwrap()
            .entry((function.start(), request.kind))
            .or_default() += 1;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_at == Some(function.start()) {
            return Err(BuildError::NoUnwindInfo);
        }
        let quarter = function.len() / 4;
        for i in 0..4 {
            let start = function.start() + i * quarter;
            if i == 2 && self.panic_at == Some(function.start()) {
                panic!("decoder bug at {start:#x}");
            }
            let end = if i == 3 { function.end() } else { start + quarter };
            sink.push(Interval::new(start, end), TestRecipe(start))?;
        }
        Ok(())
    }
}

pub type TestMap = RecipeMap<TestRecipe, BlockOracle, QuarterBuilder>;

pub fn new_map(builder: QuarterBuilder) -> TestMap {
    RecipeMap::new(BlockOracle::default(), builder)
}

pub fn mapping(token: u64, start: u64, end: u64) -> ModuleMapping {
    ModuleMapping {
        token: ModuleToken(token),
        range: Interval::new(start, end),
    }
}

/// Checks that the entries of `kind` are sorted and disjoint, and that every
/// address outside `mapped` is covered.
pub fn assert_gapless(map: &TestMap, kind: UnwinderKind, mapped: &[Interval]) {
    let entries = map.entries(kind);
    assert!(!entries.is_empty());
    let first = entries[0].interval;
    let last = entries[entries.len() - 1].interval;
    assert_eq!(first.start(), 0, "{}", map.dump(kind));
    assert_eq!(last.end(), u64::MAX, "{}", map.dump(kind));
    for pair in entries.windows(2) {
        let (a, b) = (pair[0].interval, pair[1].interval);
        assert!(a.end() <= b.start(), "overlap: {a} {b}");
        if a.end() < b.start() {
            let hole = Interval::new(a.end(), b.start());
            assert!(
                mapped.iter().any(|m| m.encloses(&hole)),
                "hole {hole} outside any mapped module\n{}",
                map.dump(kind)
            );
        }
    }
}

/// An `.eh_frame` section with one `push rbp; mov rbp, rsp` style FDE per
/// entry in `functions`, as (start, len) pairs relative to the module.
pub fn frame_pointer_eh_frame(functions: &[(u64, u32)]) -> Vec<u8> {
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 1,
        address_size: 8,
    };
    let mut cie = CommonInformationEntry::new(encoding, 1, -8, X86_64::RA);
    cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
    cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));
    let mut table = FrameTable::default();
    let cie_id = table.add_cie(cie);
    for &(start, len) in functions {
        let mut fde = FrameDescriptionEntry::new(Address::Constant(start), len);
        fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
        fde.add_instruction(1, CallFrameInstruction::Offset(X86_64::RBP, -16));
        fde.add_instruction(4, CallFrameInstruction::CfaRegister(X86_64::RBP));
        table.add_fde(cie_id, fde);
    }
    let mut eh_frame = gimli::write::EhFrame(EndianVec::new(LittleEndian));
    table.write_eh_frame(&mut eh_frame).unwrap();
    eh_frame.0.into_vec()
}
