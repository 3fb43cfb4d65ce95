//! DWARF CFI from `.eh_frame`: an FDE index that serves as the source of
//! function bounds, and a decoder that turns an FDE's unwind table rows into
//! x86_64 recipes.

use alloc::vec::Vec;

use fallible_iterator::FallibleIterator;
use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, EhFrameOffset, EndianSlice, LittleEndian,
    ReaderOffset, RegisterRule, UnwindSection, UnwindTable, X86_64,
};
use tracing::trace;

use crate::error::BuildError;
use crate::interval::Interval;
use crate::provider::RecipeSink;
use crate::recipe::Recipe;
use crate::x86_64::RecipeX86_64;

type Reader<'a> = EndianSlice<'a, LittleEndian>;

fn eh_frame_section(data: &[u8]) -> EhFrame<Reader<'_>> {
    let mut eh_frame = EhFrame::new(data, LittleEndian);
    eh_frame.set_address_size(8);
    eh_frame
}

/// The address range of one FDE and where to find it in the section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdeRecord {
    pub start: u64,
    pub len: u64,
    pub offset: usize,
}

impl FdeRecord {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }
}

/// A binary search table for eh_frame FDEs.
#[derive(Clone, Debug, Default)]
pub struct FdeIndex {
    /// Sorted by `start`.
    records: Vec<FdeRecord>,
}

impl FdeIndex {
    pub fn try_new(eh_frame_data: &[u8], bases: &BaseAddresses) -> Result<Self, gimli::Error> {
        let eh_frame = eh_frame_section(eh_frame_data);
        let mut records = Vec::new();
        let mut cur_cie = None;
        let mut entries = eh_frame.entries(bases);
        while let Some(entry) = entries.next()? {
            let partial_fde = match entry {
                CieOrFde::Cie(cie) => {
                    cur_cie = Some(cie);
                    continue;
                }
                CieOrFde::Fde(partial_fde) => partial_fde,
            };
            let fde = partial_fde.parse(|section, bases, cie_offset| {
                if let Some(cie) = &cur_cie {
                    if cie.offset() == cie_offset.0 {
                        return Ok(cie.clone());
                    }
                }
                section.cie_from_offset(bases, cie_offset)
            })?;
            if fde.len() == 0 {
                continue;
            }
            records.push(FdeRecord {
                start: fde.initial_address(),
                len: fde.len(),
                offset: fde.offset(),
            });
        }
        records.sort_by_key(|r| r.start);
        Ok(Self { records })
    }

    pub fn fde_for_address(&self, address: u64) -> Option<&FdeRecord> {
        let i = match self.records.binary_search_by_key(&address, |r| r.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let record = &self.records[i];
        (address < record.end()).then_some(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdeRecord> + '_ {
        self.records.iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionError {
    CfaIsExpression,
    CfaIsOffsetFromUnknownRegister,
    CfaOffsetNotMultipleOf8,
    ReturnAddressRuleWithUnexpectedOffset,
    ReturnAddressRuleWasWeird,
    SpOffsetDoesNotFit,
    RegisterNotStoredRelativeToCfa,
    BpStorageOffsetDoesNotFit,
    FramePointerRuleDoesNotRestoreBp,
    FramePointerRuleHasStrangeBpOffset,
}

fn register_rule_to_cfa_offset<T: ReaderOffset>(
    rule: &RegisterRule<T>,
) -> Result<Option<i64>, ConversionError> {
    match *rule {
        RegisterRule::Undefined | RegisterRule::SameValue => Ok(None),
        RegisterRule::Offset(offset) => Ok(Some(offset)),
        _ => Err(ConversionError::RegisterNotStoredRelativeToCfa),
    }
}

/// Express one row of CFI as a recipe, if it is of a shape a recipe can
/// describe.
pub fn translate_row<T: ReaderOffset>(
    cfa_rule: &CfaRule<T>,
    bp_rule: &RegisterRule<T>,
    ra_rule: &RegisterRule<T>,
) -> Result<RecipeX86_64, ConversionError> {
    match ra_rule {
        // The return address is at [CFA-8], whether or not that is spelled out.
        RegisterRule::Undefined => {}
        RegisterRule::Offset(-8) => {}
        RegisterRule::Offset(_) => {
            return Err(ConversionError::ReturnAddressRuleWithUnexpectedOffset)
        }
        _ => return Err(ConversionError::ReturnAddressRuleWasWeird),
    }

    let CfaRule::RegisterAndOffset { register, offset } = cfa_rule else {
        return Err(ConversionError::CfaIsExpression);
    };
    let offset = *offset;
    match *register {
        X86_64::RSP => {
            if offset % 8 != 0 {
                return Err(ConversionError::CfaOffsetNotMultipleOf8);
            }
            let sp_offset_by_8 =
                u16::try_from(offset / 8).map_err(|_| ConversionError::SpOffsetDoesNotFit)?;
            match register_rule_to_cfa_offset(bp_rule)? {
                None => Ok(RecipeX86_64::OffsetSp { sp_offset_by_8 }),
                Some(bp_cfa_offset) => {
                    let bp_storage_offset_from_sp_by_8 =
                        i16::try_from((offset + bp_cfa_offset) / 8)
                            .map_err(|_| ConversionError::BpStorageOffsetDoesNotFit)?;
                    Ok(RecipeX86_64::OffsetSpAndRestoreBp {
                        sp_offset_by_8,
                        bp_storage_offset_from_sp_by_8,
                    })
                }
            }
        }
        X86_64::RBP => {
            let bp_cfa_offset = register_rule_to_cfa_offset(bp_rule)?
                .ok_or(ConversionError::FramePointerRuleDoesNotRestoreBp)?;
            if offset == 16 && bp_cfa_offset == -16 {
                Ok(RecipeX86_64::UseFramePointer)
            } else {
                Err(ConversionError::FramePointerRuleHasStrangeBpOffset)
            }
        }
        _ => Err(ConversionError::CfaIsOffsetFromUnknownRegister),
    }
}

/// The rows of one FDE as (address range, recipe) pairs, clipped to the
/// function and shifted by the module's load bias. Rows that cannot be
/// translated get the fallback recipe.
pub struct RecipeRows<'a, 'ctx> {
    table: UnwindTable<'a, 'ctx, Reader<'a>>,
    function: Interval,
    bias: u64,
}

impl<'a, 'ctx> FallibleIterator for RecipeRows<'a, 'ctx> {
    type Item = (Interval, RecipeX86_64);
    type Error = gimli::Error;

    fn next(&mut self) -> Result<Option<Self::Item>, gimli::Error> {
        loop {
            let Some(row) = self.table.next_row()? else {
                return Ok(None);
            };
            let start = row.start_address().wrapping_add(self.bias);
            let end = row.end_address().wrapping_add(self.bias);
            let start = start.max(self.function.start());
            let end = end.min(self.function.end());
            if start >= end {
                continue;
            }
            let recipe = translate_row(
                row.cfa(),
                &row.register(X86_64::RBP),
                &row.register(X86_64::RA),
            )
            .unwrap_or_else(|err| {
                trace!(?err, start = format_args!("{start:#x}"), "using fallback recipe");
                RecipeX86_64::fallback()
            });
            return Ok(Some((Interval::new(start, end), recipe)));
        }
    }
}

/// Emit the recipes of the FDE at `fde_offset` into `sink`. FDE addresses are
/// stated relative to the module; `bias` maps them into the address space.
pub fn build_dwarf_recipes(
    eh_frame_data: &[u8],
    bases: &BaseAddresses,
    fde_offset: usize,
    bias: u64,
    sink: &mut RecipeSink<'_, RecipeX86_64>,
) -> Result<(), BuildError> {
    let eh_frame = eh_frame_section(eh_frame_data);
    let fde = eh_frame.fde_from_offset(bases, EhFrameOffset(fde_offset), EhFrame::cie_from_offset)?;
    let function = sink.function();
    let recipes: Vec<(Interval, RecipeX86_64)> = {
        let table = fde.rows(&eh_frame, bases, sink.unwind_context())?;
        RecipeRows {
            table,
            function,
            bias,
        }
        .collect()?
    };
    for (interval, recipe) in recipes {
        sink.push(interval, recipe)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::free_list::{LocalFreeList, SharedFreeList};
    use alloc::sync::Arc;
    use gimli::write::{
        Address, CallFrameInstruction, CommonInformationEntry, EndianVec, FrameDescriptionEntry,
        FrameTable,
    };

    /// Two frame-pointer functions at 0x1000 and 0x2000.
    fn eh_frame_bytes() -> Vec<u8> {
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
        for start in [0x2000, 0x1000] {
            let mut fde = FrameDescriptionEntry::new(Address::Constant(start), 0x40);
            fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
            fde.add_instruction(1, CallFrameInstruction::Offset(X86_64::RBP, -16));
            fde.add_instruction(4, CallFrameInstruction::CfaRegister(X86_64::RBP));
            table.add_fde(cie_id, fde);
        }
        let mut eh_frame = gimli::write::EhFrame(EndianVec::new(LittleEndian));
        table.write_eh_frame(&mut eh_frame).unwrap();
        eh_frame.0.into_vec()
    }

    #[test]
    fn index_finds_fdes() {
        let data = eh_frame_bytes();
        let index = FdeIndex::try_new(&data, &BaseAddresses::default()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.iter().next().map(|r| r.start), Some(0x1000));
        assert_eq!(index.fde_for_address(0x1020).map(|r| r.end()), Some(0x1040));
        assert!(index.fde_for_address(0x1040).is_none());
        assert!(index.fde_for_address(0xfff).is_none());
        assert_eq!(index.fde_for_address(0x203f).map(|r| r.start), Some(0x2000));
    }

    #[test]
    fn rows_become_recipes() {
        let data = eh_frame_bytes();
        let bases = BaseAddresses::default();
        let index = FdeIndex::try_new(&data, &bases).unwrap();
        let fde = *index.fde_for_address(0x2000).unwrap();

        let bias = 0x7f00_0000_0000;
        let function = Interval::new(fde.start + bias, fde.end() + bias);
        let mut chain = Vec::new();
        let mut nodes = LocalFreeList::new(Arc::new(SharedFreeList::new()), 4);
        let mut ctx = gimli::UnwindContext::new();
        let mut sink = RecipeSink::new(function, &mut chain, &mut nodes, &mut ctx);
        build_dwarf_recipes(&data, &bases, fde.offset, bias, &mut sink).unwrap();
        let tree = sink.finish().unwrap();
        let recipes: Vec<_> = tree
            .iter()
            .map(|n| (n.interval().start() - bias, n.interval().end() - bias, n.recipe()))
            .collect();
        assert_eq!(
            recipes,
            [
                (0x2000, 0x2001, RecipeX86_64::OffsetSp { sp_offset_by_8: 1 }),
                (
                    0x2001,
                    0x2004,
                    RecipeX86_64::OffsetSpAndRestoreBp {
                        sp_offset_by_8: 2,
                        bp_storage_offset_from_sp_by_8: 0
                    }
                ),
                (0x2004, 0x2040, RecipeX86_64::UseFramePointer),
            ]
        );
    }

    #[test]
    fn translation_rejects_unusual_rules() {
        let cfa = CfaRule::<usize>::RegisterAndOffset {
            register: X86_64::RSP,
            offset: 12,
        };
        assert_eq!(
            translate_row(&cfa, &RegisterRule::Undefined, &RegisterRule::Undefined),
            Err(ConversionError::CfaOffsetNotMultipleOf8)
        );
        let cfa = CfaRule::<usize>::RegisterAndOffset {
            register: X86_64::RSP,
            offset: 8,
        };
        assert_eq!(
            translate_row(&cfa, &RegisterRule::Undefined, &RegisterRule::Offset(-16)),
            Err(ConversionError::ReturnAddressRuleWithUnexpectedOffset)
        );
        let cfa = CfaRule::<usize>::RegisterAndOffset {
            register: X86_64::RBP,
            offset: 32,
        };
        assert_eq!(
            translate_row(&cfa, &RegisterRule::Offset(-16), &RegisterRule::Undefined),
            Err(ConversionError::FramePointerRuleHasStrangeBpOffset)
        );
    }
}
