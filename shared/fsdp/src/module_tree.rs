//! Module-tree traversal for parameter discovery (§4.6, grounded in the
//! reference's `_get_param_module_infos`/`_named_parameters_with_duplicates`).
//!
//! The real module tree (attribute graph, parameter storage, autograd
//! registration) is an external collaborator per the spec's scope. This
//! module only needs a thin `Module` trait so the traversal and the
//! parameter-rebinding logic in [`crate::param`] can be exercised against an
//! in-memory mock tree in tests, including the shared-parameter and
//! shared-submodule fixtures (S5).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use crate::error::FsdpError;

/// The live value behind a parameter attribute: either the sharded-tensor
/// wrapper or the unsharded view, carrying a stable identity so modules can
/// observe the current form through a shared handle rather than a fresh copy
/// each time. See DESIGN NOTES §9: "tagged parameter cell with stable
/// identity that modules observe through a trait."
#[derive(Debug, Clone)]
pub enum ParamCellValue {
    Sharded(tch::Tensor),
    Unsharded(tch::Tensor),
}

pub type ParamCellHandle = Arc<RwLock<ParamCellValue>>;

pub fn new_param_cell(initial: tch::Tensor) -> ParamCellHandle {
    Arc::new(RwLock::new(ParamCellValue::Sharded(initial)))
}

/// A node in the module tree. `name` identifies this node for logging only;
/// identity for shared-module detection is the `Rc` pointer.
pub trait Module: std::fmt::Debug {
    /// Direct children, in the same duplicate-preserving order the reference
    /// traversal relies on (a child reachable through two attributes must be
    /// yielded twice).
    fn named_children(&self) -> Vec<(String, Rc<RefCell<dyn Module>>)>;

    /// Parameters owned directly by this node (not recursing into
    /// children), in duplicate-preserving order.
    fn named_parameters(&self) -> Vec<(String, ParamCellHandle)>;

    /// Swap the live value behind an owned parameter attribute. Called by
    /// [`crate::param::FSDPParam::to_sharded`]/`to_unsharded`.
    fn rebind_parameter(&mut self, name: &str, cell: ParamCellHandle);
}

/// Resolved binding for one logical parameter: its primary owning module plus
/// every additional (module, attribute-name) pair that aliases the same
/// parameter (shared parameter) or is itself an alias of the primary module
/// (shared module).
#[derive(Clone)]
pub struct ParamModuleInfo {
    pub module: Rc<RefCell<dyn Module>>,
    pub param_name: String,
    pub shared_modules: Vec<Rc<RefCell<dyn Module>>>,
    pub shared_param_names: Vec<String>,
}

impl std::fmt::Debug for ParamModuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamModuleInfo")
            .field("param_name", &self.param_name)
            .field("shared_param_names", &self.shared_param_names)
            .finish()
    }
}

impl ParamModuleInfo {
    /// All (module, attribute-name) bindings that must be rebound together
    /// whenever this parameter transitions between sharded/unsharded form.
    pub fn all_bindings(&self) -> Vec<(Rc<RefCell<dyn Module>>, String)> {
        let mut bindings = vec![(self.module.clone(), self.param_name.clone())];
        for (module, name) in self.shared_modules.iter().zip(&self.shared_param_names) {
            bindings.push((module.clone(), name.clone()));
        }
        bindings
    }
}

/// Duplicate-preserving walk of `root`'s subtree, resolving a
/// [`ParamModuleInfo`] for each handle in `params`.
///
/// Does not deduplicate shared submodules or shared parameters: the first
/// (module, name) binding encountered becomes the primary, and every later
/// binding of the same parameter handle is appended to its `shared_modules`/
/// `shared_param_names`. Fails with [`FsdpError::ParamNotInModule`] if any
/// requested parameter handle is never found bound anywhere in the subtree.
pub fn discover_param_module_infos(
    params: &[ParamCellHandle],
    root: &Rc<RefCell<dyn Module>>,
) -> Result<Vec<ParamModuleInfo>, FsdpError> {
    let mut found: Vec<Option<ParamModuleInfo>> = vec![None; params.len()];

    let mut stack = vec![root.clone()];
    while let Some(module) = stack.pop() {
        for (param_name, cell) in module.borrow().named_parameters() {
            if let Some(idx) = params.iter().position(|p| Arc::ptr_eq(p, &cell)) {
                match &mut found[idx] {
                    slot @ None => {
                        *slot = Some(ParamModuleInfo {
                            module: module.clone(),
                            param_name,
                            shared_modules: Vec::new(),
                            shared_param_names: Vec::new(),
                        });
                    }
                    Some(info) => {
                        info.shared_modules.push(module.clone());
                        info.shared_param_names.push(param_name);
                    }
                }
            }
        }
        // Traverse children in reverse so overall visitation order matches
        // depth-first pre-order (stack is LIFO).
        for (_, child) in module.borrow().named_children().into_iter().rev() {
            stack.push(child);
        }
    }

    found
        .into_iter()
        .enumerate()
        .map(|(i, info)| {
            info.ok_or_else(|| FsdpError::ParamNotInModule(format!("param[{i}]")))
        })
        .collect()
}
