use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, Range};
use core::sync::atomic::{AtomicU64, Ordering};

use gimli::BaseAddresses;
use spin::RwLock;
use tracing::{debug, warn};

use crate::dwarf::{build_dwarf_recipes, FdeIndex};
use crate::error::BuildError;
use crate::interval::Interval;
use crate::provider::{
    BuildRequest, FunctionBounds, FunctionBoundsOracle, IntervalBuilder, ModuleMapping,
    ModuleToken, RecipeSink,
};
use crate::recipe::UnwinderKind;
use crate::x86_64::{build_prologue_recipes, RecipeX86_64};

/// The sections of a module that recipes are decoded from, with their
/// stated (pre-relocation) addresses.
pub struct ModuleSections<D: Deref<Target = [u8]>> {
    pub text_svma: Option<Range<u64>>,
    pub text: Option<D>,
    pub eh_frame_svma: Option<Range<u64>>,
    pub eh_frame: Option<D>,
}

/// A binary image mapped into the profiled process.
pub struct Module<D: Deref<Target = [u8]>> {
    name: String,
    avma_range: Range<u64>,
    /// Actual and stated address of the image base; their difference is the
    /// load bias.
    base_avma: u64,
    base_svma: u64,
    sections: ModuleSections<D>,
    bases: BaseAddresses,
    fde_index: FdeIndex,
}

impl<D: Deref<Target = [u8]>> Module<D> {
    pub fn new(
        name: String,
        avma_range: Range<u64>,
        base_avma: u64,
        base_svma: u64,
        sections: ModuleSections<D>,
    ) -> Self {
        let mut bases = BaseAddresses::default();
        if let Some(svma) = &sections.eh_frame_svma {
            bases = bases.set_eh_frame(svma.start);
        }
        if let Some(svma) = &sections.text_svma {
            bases = bases.set_text(svma.start);
        }
        let fde_index = match &sections.eh_frame {
            Some(data) => FdeIndex::try_new(data, &bases).unwrap_or_else(|err| {
                warn!(%name, %err, "could not index eh_frame");
                FdeIndex::default()
            }),
            None => FdeIndex::default(),
        };
        debug!(%name, fdes = fde_index.len(), "module loaded");
        Self {
            name,
            avma_range,
            base_avma,
            base_svma,
            sections,
            bases,
            fde_index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn avma_range(&self) -> Range<u64> {
        self.avma_range.clone()
    }

    pub fn bias(&self) -> u64 {
        self.base_avma.wrapping_sub(self.base_svma)
    }

    pub fn fde_index(&self) -> &FdeIndex {
        &self.fde_index
    }

    fn function_bounds(&self, address: u64) -> Option<(u64, u64)> {
        let bias = self.bias();
        let fde = self.fde_index.fde_for_address(address.wrapping_sub(bias))?;
        Some((fde.start.wrapping_add(bias), fde.end().wrapping_add(bias)))
    }

    fn build_dwarf(
        &self,
        function: Interval,
        sink: &mut RecipeSink<'_, RecipeX86_64>,
    ) -> Result<(), BuildError> {
        let eh_frame = self.sections.eh_frame.as_deref().ok_or(BuildError::NoUnwindInfo)?;
        let bias = self.bias();
        let fde = self
            .fde_index
            .fde_for_address(function.start().wrapping_sub(bias))
            .ok_or(BuildError::NoUnwindInfo)?;
        build_dwarf_recipes(eh_frame, &self.bases, fde.offset, bias, sink)
    }

    fn build_native(
        &self,
        function: Interval,
        sink: &mut RecipeSink<'_, RecipeX86_64>,
    ) -> Result<(), BuildError> {
        let (Some(text), Some(text_svma)) = (self.sections.text.as_deref(), &self.sections.text_svma)
        else {
            return Err(BuildError::NoUnwindInfo);
        };
        let svma = function.start().wrapping_sub(self.bias());
        if !text_svma.contains(&svma) {
            return Err(BuildError::NoUnwindInfo);
        }
        let offset = (svma - text_svma.start) as usize;
        let len = function.len().min(text_svma.end - svma) as usize;
        let bytes = text
            .get(offset..)
            .map(|rest| &rest[..len.min(rest.len())])
            .ok_or(BuildError::NoUnwindInfo)?;
        build_prologue_recipes(bytes, function, sink)
    }
}

struct RegisteredModule<D: Deref<Target = [u8]>> {
    token: ModuleToken,
    module: Arc<Module<D>>,
}

/// The set of loaded modules. Serves as both the function bounds oracle and
/// the recipe decoder for x86_64 code.
///
/// Registering a module does not make its addresses resolvable by itself;
/// the returned [`ModuleMapping`] must also be reported to the recipe map.
pub struct ModuleRegistry<D: Deref<Target = [u8]>> {
    /// Sorted by start address.
    modules: RwLock<Vec<RegisteredModule<D>>>,
    next_token: AtomicU64,
}

impl<D: Deref<Target = [u8]>> Default for ModuleRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>> ModuleRegistry<D> {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn add_module(&self, module: Module<D>) -> ModuleMapping {
        let token = ModuleToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let range = Interval::new(module.avma_range.start, module.avma_range.end);
        let mut modules = self.modules.write();
        let insertion_index =
            match modules.binary_search_by_key(&range.start(), |m| m.module.avma_range.start) {
                Ok(i) => {
                    warn!(
                        start = format_args!("{:#x}", range.start()),
                        "two modules at the same start address"
                    );
                    i
                }
                Err(i) => i,
            };
        modules.insert(
            insertion_index,
            RegisteredModule {
                token,
                module: Arc::new(module),
            },
        );
        ModuleMapping { token, range }
    }

    /// Forget the module starting at `start_avma`. The returned mapping is
    /// what to report as unmapped.
    pub fn remove_module(&self, start_avma: u64) -> Option<ModuleMapping> {
        let mut modules = self.modules.write();
        let index = modules
            .binary_search_by_key(&start_avma, |m| m.module.avma_range.start)
            .ok()?;
        let removed = modules.remove(index);
        let range = removed.module.avma_range();
        Some(ModuleMapping {
            token: removed.token,
            range: Interval::new(range.start, range.end),
        })
    }

    pub fn find_module_for_address(&self, address: u64) -> Option<(ModuleToken, Arc<Module<D>>)> {
        let modules = self.modules.read();
        let i = match modules.binary_search_by_key(&address, |m| m.module.avma_range.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let m = &modules[i];
        m.module
            .avma_range
            .contains(&address)
            .then(|| (m.token, m.module.clone()))
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Deref<Target = [u8]>> FunctionBoundsOracle for ModuleRegistry<D> {
    fn function_bounds(&self, address: u64) -> Option<FunctionBounds> {
        let (token, module) = self.find_module_for_address(address)?;
        let (start, end) = module.function_bounds(address)?;
        Some(FunctionBounds {
            start,
            end,
            module: Some(token),
        })
    }
}

impl<D: Deref<Target = [u8]>> IntervalBuilder<RecipeX86_64> for ModuleRegistry<D> {
    fn build_intervals(
        &self,
        request: &BuildRequest,
        sink: &mut RecipeSink<'_, RecipeX86_64>,
    ) -> Result<(), BuildError> {
        let (token, module) = self
            .find_module_for_address(request.function.start())
            .ok_or(BuildError::NoUnwindInfo)?;
        if request.module.is_some_and(|m| m != token) {
            return Err(BuildError::NoUnwindInfo);
        }
        match request.kind {
            UnwinderKind::Dwarf => module.build_dwarf(request.function, sink),
            UnwinderKind::Native => module.build_native(request.function, sink),
        }
    }
}
