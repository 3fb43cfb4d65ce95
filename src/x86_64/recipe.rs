use super::regs::RegsX86_64;
use crate::error::StepError;
use crate::recipe::Recipe;

/// For all of these: return address is *(new_sp - 8)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipeX86_64 {
    /// (sp, bp) = (sp + 8, bp)
    JustReturn,
    /// (sp, bp) = if is_first_frame (sp + 8, bp) else (bp + 16, *bp)
    JustReturnIfFirstFrameOtherwiseFp,
    /// (sp, bp) = (sp + 8x, bp)
    OffsetSp { sp_offset_by_8: u16 },
    /// (sp, bp) = (sp + 8x, *(sp + 8y))
    OffsetSpAndRestoreBp {
        sp_offset_by_8: u16,
        bp_storage_offset_from_sp_by_8: i16,
    },
    /// (sp, bp) = (bp + 16, *bp)
    UseFramePointer,
}

impl Recipe for RecipeX86_64 {
    fn fallback() -> Self {
        RecipeX86_64::UseFramePointer
    }
}

impl RecipeX86_64 {
    /// Recover the caller's registers. Returns the caller's return address,
    /// or `None` once the walk has reached the root of the stack.
    pub fn unwind_step<F>(
        self,
        is_first_frame: bool,
        regs: &mut RegsX86_64,
        read_stack: &mut F,
    ) -> Result<Option<u64>, StepError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let sp = regs.sp();
        let (new_sp, new_bp) = match self {
            RecipeX86_64::JustReturn => {
                let new_sp = sp.checked_add(8).ok_or(StepError::IntegerOverflow)?;
                (new_sp, regs.bp())
            }
            RecipeX86_64::JustReturnIfFirstFrameOtherwiseFp => {
                if is_first_frame {
                    let new_sp = sp.checked_add(8).ok_or(StepError::IntegerOverflow)?;
                    (new_sp, regs.bp())
                } else {
                    match frame_pointer_step(regs, read_stack)? {
                        Some(sp_and_bp) => sp_and_bp,
                        None => return Ok(None),
                    }
                }
            }
            RecipeX86_64::OffsetSp { sp_offset_by_8 } => {
                let sp_offset = u64::from(sp_offset_by_8) * 8;
                let new_sp = sp.checked_add(sp_offset).ok_or(StepError::IntegerOverflow)?;
                (new_sp, regs.bp())
            }
            RecipeX86_64::OffsetSpAndRestoreBp {
                sp_offset_by_8,
                bp_storage_offset_from_sp_by_8,
            } => {
                let sp_offset = u64::from(sp_offset_by_8) * 8;
                let new_sp = sp.checked_add(sp_offset).ok_or(StepError::IntegerOverflow)?;
                let bp_storage_offset_from_sp = i64::from(bp_storage_offset_from_sp_by_8) * 8;
                let bp_location = sp
                    .checked_add_signed(bp_storage_offset_from_sp)
                    .ok_or(StepError::IntegerOverflow)?;
                let new_bp = match read_stack(bp_location) {
                    Ok(new_bp) => new_bp,
                    // Epilogues can describe bp as saved below sp, where the
                    // sampled stack bytes may not reach.
                    Err(()) if is_first_frame && bp_location < sp => regs.bp(),
                    Err(()) => return Err(StepError::CouldNotReadStack(bp_location)),
                };
                (new_sp, new_bp)
            }
            RecipeX86_64::UseFramePointer => match frame_pointer_step(regs, read_stack)? {
                Some(sp_and_bp) => sp_and_bp,
                None => return Ok(None),
            },
        };
        let return_address_location = new_sp.checked_sub(8).ok_or(StepError::IntegerOverflow)?;
        let return_address = read_stack(return_address_location)
            .map_err(|_| StepError::CouldNotReadStack(return_address_location))?;
        if return_address == 0 {
            return Ok(None);
        }
        if new_sp == sp && return_address == regs.ip() {
            return Err(StepError::DidNotAdvance);
        }
        regs.set_ip(return_address);
        regs.set_sp(new_sp);
        regs.set_bp(new_bp);
        Ok(Some(return_address))
    }
}

/// `push rbp; mov rbp, rsp` frames form a linked list on the stack: `*bp` is
/// the caller's bp and `*(bp + 8)` the return address.
fn frame_pointer_step<F>(
    regs: &RegsX86_64,
    read_stack: &mut F,
) -> Result<Option<(u64, u64)>, StepError>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    let sp = regs.sp();
    let bp = regs.bp();
    if bp == 0 {
        return Ok(None);
    }
    let new_sp = bp.checked_add(16).ok_or(StepError::IntegerOverflow)?;
    if new_sp <= sp {
        return Err(StepError::FramepointerUnwindingMovedBackwards);
    }
    let new_bp = read_stack(bp).map_err(|_| StepError::CouldNotReadStack(bp))?;
    Ok(Some((new_sp, new_bp)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn just_return() {
        let stack = [1, 2, 0x100300, 4, 5, 6];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let mut regs = RegsX86_64::new(0x100400, 0x10, 0x20);
        let res = RecipeX86_64::JustReturn.unwind_step(true, &mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x100300)));
        assert_eq!(regs.ip(), 0x100300);
        assert_eq!(regs.sp(), 0x18);
        assert_eq!(regs.bp(), 0x20);
    }

    #[test]
    fn use_frame_pointer() {
        let stack = [1, 2, 3, 4, 0x40, 0x100200, 5, 6, 0x70, 0x100100, 7, 8, 9, 10, 0x0, 0x0];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let mut regs = RegsX86_64::new(0x100400, 0x10, 0x20);
        let res = RecipeX86_64::UseFramePointer.unwind_step(false, &mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x100200)));
        assert_eq!(regs.sp(), 0x30);
        assert_eq!(regs.bp(), 0x40);
        let res = RecipeX86_64::UseFramePointer.unwind_step(false, &mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x100100)));
        assert_eq!(regs.sp(), 0x50);
        assert_eq!(regs.bp(), 0x70);
        let res = RecipeX86_64::UseFramePointer.unwind_step(false, &mut regs, &mut read_stack);
        assert_eq!(res, Ok(None));
    }

    #[test]
    fn first_frame_rule_depends_on_position() {
        let stack = [1, 0x100300, 3, 4, 0x0, 0x100200, 0, 0];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let mut regs = RegsX86_64::new(0x100400, 0x8, 0x20);
        let rule = RecipeX86_64::JustReturnIfFirstFrameOtherwiseFp;
        assert_eq!(rule.unwind_step(true, &mut regs, &mut read_stack), Ok(Some(0x100300)));
        assert_eq!(regs.sp(), 0x10);

        let mut regs = RegsX86_64::new(0x100400, 0x8, 0x20);
        assert_eq!(rule.unwind_step(false, &mut regs, &mut read_stack), Ok(Some(0x100200)));
        assert_eq!(regs.sp(), 0x30);
        assert_eq!(regs.bp(), 0x0);
    }

    #[test]
    fn offset_sp_and_restore_bp() {
        let stack = [0, 0x50, 0x100500, 0, 0];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let mut regs = RegsX86_64::new(0x100400, 0x8, 0x1234);
        let rule = RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: 0,
        };
        assert_eq!(rule.unwind_step(true, &mut regs, &mut read_stack), Ok(Some(0x100500)));
        assert_eq!(regs.sp(), 0x18);
        assert_eq!(regs.bp(), 0x50);
    }

    #[test]
    fn bp_saved_below_sp() {
        let stack = [0, 0, 0x60, 0, 0x100500, 0];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let rule = RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: -1,
        };
        let mut regs = RegsX86_64::new(0x100400, 0x18, 0x1234);
        assert_eq!(rule.unwind_step(false, &mut regs, &mut read_stack), Ok(Some(0x100500)));
        assert_eq!(regs.bp(), 0x60);

        // The slot would lie below address zero.
        let rule = RecipeX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 1,
            bp_storage_offset_from_sp_by_8: -2,
        };
        let mut regs = RegsX86_64::new(0x100400, 0x8, 0x1234);
        assert_eq!(
            rule.unwind_step(false, &mut regs, &mut read_stack),
            Err(StepError::IntegerOverflow)
        );
    }

    #[test]
    fn unreadable_stack_is_an_error() {
        let mut read_stack = |_| Err(());
        let mut regs = RegsX86_64::new(0x100400, 0x10, 0x20);
        assert_eq!(
            RecipeX86_64::OffsetSp { sp_offset_by_8: 1 }.unwind_step(
                false,
                &mut regs,
                &mut read_stack
            ),
            Err(StepError::CouldNotReadStack(0x10))
        );
        assert_eq!(regs, RegsX86_64::new(0x100400, 0x10, 0x20));
    }
}
