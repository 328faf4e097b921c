use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction a [`Facet`] flows in a capability's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetDirection {
    Input,
    Output,
}

/// A named, versioned, schema-typed data item exchanged between capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facet {
    pub name: String,
    pub direction: FacetDirection,
    pub schema: Value,
    pub summary: String,
    #[serde(default = "default_facet_version")]
    pub version: u32,
}

fn default_facet_version() -> u32 {
    1
}

/// The result of [`crate::FacetCatalogLike::compile_contracts`]-style compilation:
/// a synthesized JSON Schema per direction plus the facet names that contributed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledContracts {
    pub input_schema: Value,
    pub output_schema: Value,
    pub provenance: Vec<String>,
}
