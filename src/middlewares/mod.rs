//! Standard middlewares (C5, §4.5): reusable chain links built on top of the
//! C2 `Middleware` trait, independent of any particular `Provider`.

pub mod context_extraction;
pub mod prompt_assembly;
pub mod state_store_mw;
pub mod template_render;
pub mod validator;

pub use context_extraction::ContextExtraction;
pub use prompt_assembly::PromptAssembly;
pub use state_store_mw::{StateStoreLoad, StateStoreSave};
pub use template_render::TemplateRender;
pub use validator::{ValidationRule, Validator};
