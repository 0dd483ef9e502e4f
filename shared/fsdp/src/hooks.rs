//! Autograd hook bridge (§4.4).
//!
//! The reference implementation installs an identity `autograd.Function`
//! whose backward fires `FSDPParamGroup::_post_backward`. The autograd engine
//! itself is an external collaborator (Non-goals: "does not define the
//! autograd graph"), so this crate expresses the bridge as a trait a real
//! autograd integration implements, plus a manual-fire stand-in used by
//! tests (and by [`crate::param_group::FSDPParamGroup::finalize_backward`]'s
//! fallback path, which never goes through this trait at all).

use std::cell::RefCell;
use std::rc::Rc;

use tch::Tensor;

/// Installs a post-backward callback on the forward inputs that require
/// gradient. Must invoke `on_backward` exactly once per backward pass, the
/// first time any installed input's gradient becomes available, and must not
/// extend the group's lifetime past the training step (§9 DESIGN NOTES).
pub trait AutogradHookInstaller: std::fmt::Debug {
    fn install(&self, inputs: Vec<Tensor>, on_backward: Rc<dyn Fn()>) -> Vec<Tensor>;
}

/// Filters `inputs` down to tensors that require gradient and routes them
/// through `installer`. Returns the (possibly identical) tensors to use in
/// place of the originals, mirroring `_register_post_backward_hook`'s
/// tree-flatten/rewrite. If no input requires gradient, returns `inputs`
/// unchanged and does not touch the installer (the hook never fires; the
/// group relies on `finalize_backward` instead).
pub fn register_post_backward_hook(
    installer: &dyn AutogradHookInstaller,
    inputs: Vec<Tensor>,
    on_backward: Rc<dyn Fn()>,
) -> Vec<Tensor> {
    let any_requires_grad = inputs.iter().any(|t| t.requires_grad());
    if !any_requires_grad {
        return inputs;
    }
    installer.install(inputs, on_backward)
}

/// Test/manual-drive implementation: records installed callbacks instead of
/// wiring into a real autograd graph. Production code supplies a real
/// autograd-backed `AutogradHookInstaller` instead of this one.
#[derive(Debug, Default)]
pub struct ManualFireHookInstaller {
    callbacks: RefCell<Vec<Rc<dyn Fn()>>>,
}

impl ManualFireHookInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backward pass reaching every installed hook: fires each
    /// registered callback exactly once, then clears the registry so the
    /// next iteration starts fresh.
    pub fn fire_all(&self) {
        let callbacks = self.callbacks.borrow_mut().split_off(0);
        for callback in callbacks {
            callback();
        }
    }

    pub fn pending(&self) -> usize {
        self.callbacks.borrow().len()
    }
}

impl AutogradHookInstaller for ManualFireHookInstaller {
    fn install(&self, inputs: Vec<Tensor>, on_backward: Rc<dyn Fn()>) -> Vec<Tensor> {
        self.callbacks.borrow_mut().push(on_backward);
        inputs
    }
}
