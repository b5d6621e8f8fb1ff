//! The two reconciliation paths
//!
//! - [`decision`]: periodic analysis of Savings Plan and Reserved Instance
//!   data into cost-decision overlays
//! - [`preference`]: NodePool-event driven rendering of preference
//!   annotations into preference overlays

pub mod decision;
pub mod preference;

pub use decision::{
    AnalysisReport, CostDecisionController, CostDecisionControllerBuilder, CycleReport,
    DecisionAnalyzer, SkippedAnalysis,
};
pub use preference::{NodePoolEvent, PreferenceController};
