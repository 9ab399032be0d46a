//! weave-calc: formulas over weave bot state.
//!
//! Tag values starting with `=` are formulas. [`dependency::DependencyManager`]
//! tracks which tags each formula reads; [`precalc::PrecalculationManager`]
//! uses that graph to recompute only affected values when bots change; and
//! [`session::Session`] wires both to an AUX tree so that local events and
//! remote atoms come out as [`precalc::StateUpdatedEvent`]s.
//!
//! Evaluation is pluggable through [`formula::FormulaEvaluator`];
//! [`formula::ExprEvaluator`] implements a small arithmetic language with
//! `#tag`, `@bot.tag` and `this.tag` references.

pub mod dependency;
pub mod formula;
pub mod precalc;
pub mod session;

pub use dependency::{Dependency, DependencyManager, Updates};
pub use formula::{ExprEvaluator, FormulaError, FormulaEvaluator};
pub use precalc::{
    BotUpdate, CalculationContext, PrecalculatedBot, PrecalculatedState, PrecalculationManager,
    StateUpdatedEvent,
};
pub use session::Session;
