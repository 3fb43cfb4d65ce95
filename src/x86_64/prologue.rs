use super::recipe::RecipeX86_64;
use crate::error::BuildError;
use crate::interval::Interval;
use crate::provider::RecipeSink;

const ENDBR64: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];
const PUSH_RBP: u8 = 0x55;
/// `mov rbp, rsp`, in both of its encodings.
const MOV_RBP_RSP: [[u8; 3]; 2] = [[0x48, 0x89, 0xe5], [0x48, 0x8b, 0xec]];

/// Where a function sets up its frame pointer, as offsets from its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSetup {
    /// Offset of `push rbp`.
    pub push_offset: usize,
    /// Offset of the first instruction after `mov rbp, rsp`.
    pub established_offset: usize,
}

/// Detect `push rbp; mov rbp, rsp` at the start of `text`, optionally
/// preceded by `endbr64`.
pub fn detect_frame_setup(text: &[u8]) -> Option<FrameSetup> {
    let push_offset = if text.starts_with(&ENDBR64) { ENDBR64.len() } else { 0 };
    let rest = text.get(push_offset..)?;
    if rest.first() != Some(&PUSH_RBP) {
        return None;
    }
    let mov = rest.get(1..4)?;
    if !MOV_RBP_RSP.iter().any(|m| m == mov) {
        return None;
    }
    Some(FrameSetup {
        push_offset,
        established_offset: push_offset + 4,
    })
}

/// Emit recipes for `function` from the bytes of its body, `text`, which
/// start at `function.start()`.
///
/// With a recognized frame setup the function gets three recipes: before
/// `push rbp` the return address is on top of the stack, between the push
/// and the `mov` the caller's bp sits below it, and from then on bp is a
/// frame pointer. Without one, the function gets a single recipe that trusts
/// the frame pointer everywhere except in the innermost frame.
pub fn build_prologue_recipes(
    text: &[u8],
    function: Interval,
    sink: &mut RecipeSink<'_, RecipeX86_64>,
) -> Result<(), BuildError> {
    let Some(setup) = detect_frame_setup(text) else {
        return sink.push(function, RecipeX86_64::JustReturnIfFirstFrameOtherwiseFp);
    };
    let (start, end) = (function.start(), function.end());
    let at = |offset: usize| start.saturating_add(offset as u64).min(end);
    let pushed = at(setup.push_offset + 1);
    let established = at(setup.established_offset);
    sink.push(Interval::new(start, pushed), RecipeX86_64::JustReturn)?;
    sink.push(
        Interval::new(pushed, established),
        RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: 0,
        },
    )?;
    sink.push(
        Interval::new(established, end),
        RecipeX86_64::UseFramePointer,
    )
}
