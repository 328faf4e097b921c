use std::collections::HashMap;

use serde_json::{json, Map, Value};

use flex_types::facet::{CompiledContracts, Facet, FacetDirection};

use crate::errors::FacetCatalogError;

/// Static registry of named facets, loaded once at process start.
/// Lookups are pure — no interior mutability, no locking.
#[derive(Debug, Clone)]
pub struct FacetCatalog {
    facets: HashMap<String, Facet>,
}

impl FacetCatalog {
    pub fn new(facets: Vec<Facet>) -> Self {
        let facets = facets.into_iter().map(|f| (f.name.clone(), f)).collect();
        Self { facets }
    }

    pub fn get(&self, name: &str) -> Option<&Facet> {
        self.facets.get(name)
    }

    pub fn list(&self) -> Vec<&Facet> {
        let mut out: Vec<&Facet> = self.facets.values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Resolves every name against the catalog, failing on the first
    /// unknown facet or direction mismatch. An `output` facet may be
    /// resolved as `input` (consumed by a later node); an `input`-only
    /// facet can never resolve as `output`.
    pub fn resolve_many(
        &self,
        names: &[String],
        direction: FacetDirection,
    ) -> Result<Vec<&Facet>, FacetCatalogError> {
        names
            .iter()
            .map(|name| {
                let facet = self
                    .facets
                    .get(name)
                    .ok_or_else(|| FacetCatalogError::UnknownFacet(name.clone()))?;
                if direction == FacetDirection::Output && facet.direction == FacetDirection::Input {
                    return Err(FacetCatalogError::FacetDirectionMismatch {
                        facet: name.clone(),
                        expected: "output".to_string(),
                        actual: "input".to_string(),
                    });
                }
                Ok(facet)
            })
            .collect()
    }

    /// Synthesizes a JSON Schema by unioning facet schemas: each facet
    /// becomes a property of the schema keyed by its name.
    pub fn compile_contracts(
        &self,
        input_facets: &[String],
        output_facets: &[String],
    ) -> Result<CompiledContracts, FacetCatalogError> {
        let inputs = self.resolve_many(input_facets, FacetDirection::Input)?;
        let outputs = self.resolve_many(output_facets, FacetDirection::Output)?;

        let input_schema = union_schema(&inputs);
        let output_schema = union_schema(&outputs);

        let mut provenance = input_facets.to_vec();
        provenance.extend(output_facets.iter().cloned());
        provenance.sort();
        provenance.dedup();

        Ok(CompiledContracts {
            input_schema,
            output_schema,
            provenance,
        })
    }
}

fn union_schema(facets: &[&Facet]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for facet in facets {
        properties.insert(facet.name.clone(), facet.schema.clone());
        required.push(Value::String(facet.name.clone()));
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FacetCatalog {
        FacetCatalog::new(vec![
            Facet {
                name: "creative_brief".to_string(),
                direction: FacetDirection::Output,
                schema: json!({"type": "string"}),
                summary: "the creative brief".to_string(),
                version: 1,
            },
            Facet {
                name: "company_information".to_string(),
                direction: FacetDirection::Input,
                schema: json!({"type": "object"}),
                summary: "company info".to_string(),
                version: 1,
            },
        ])
    }

    #[test]
    fn resolve_many_rejects_unknown_facets() {
        let catalog = catalog();
        let err = catalog
            .resolve_many(&["nope".to_string()], FacetDirection::Input)
            .unwrap_err();
        assert!(matches!(err, FacetCatalogError::UnknownFacet(name) if name == "nope"));
    }

    #[test]
    fn resolve_many_rejects_input_only_facet_as_output() {
        let catalog = catalog();
        let err = catalog
            .resolve_many(&["company_information".to_string()], FacetDirection::Output)
            .unwrap_err();
        assert!(matches!(err, FacetCatalogError::FacetDirectionMismatch { .. }));
    }

    #[test]
    fn compile_contracts_unions_facet_schemas_into_properties() {
        let catalog = catalog();
        let compiled = catalog
            .compile_contracts(&["company_information".to_string()], &["creative_brief".to_string()])
            .unwrap();
        assert!(compiled.input_schema["properties"]["company_information"].is_object());
        assert!(compiled.output_schema["properties"]["creative_brief"].is_object());
        assert_eq!(compiled.provenance, vec!["company_information", "creative_brief"]);
    }
}
