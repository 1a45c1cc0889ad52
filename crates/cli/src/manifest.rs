//! YAML manifests for the offline subcommands.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crust_core::{ObjectKey, PizzaOrder};
use crust_kubehub::DEFAULT_KIND;
use crust_store::SecretData;
use serde_json::Value as Json;

pub const DEFAULT_NAMESPACE: &str = "default";

pub fn read_yaml(path: &Path) -> Result<Json> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn meta_str<'a>(doc: &'a Json, field: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// `--ns` beats `metadata.namespace`, which beats "default".
pub fn order_from_manifest(doc: &Json, ns: Option<&str>) -> Result<PizzaOrder> {
    match doc.get("kind").and_then(|v| v.as_str()) {
        Some(kind) if kind != DEFAULT_KIND => bail!("expected kind {DEFAULT_KIND}, found {kind}"),
        _ => {}
    }
    let name = meta_str(doc, "name").ok_or_else(|| anyhow!("manifest has no metadata.name"))?;
    let namespace = ns.or_else(|| meta_str(doc, "namespace")).unwrap_or(DEFAULT_NAMESPACE);
    if doc.get("spec").is_none() {
        bail!("manifest {namespace}/{name} has no spec");
    }
    PizzaOrder::from_parts(ObjectKey::new(namespace, name), meta_str(doc, "uid").map(String::from), doc)
        .with_context(|| format!("decoding {namespace}/{name}"))
}

/// Secret manifest: `stringData` entries plus base64 `data` entries; `data` wins on clashes.
pub fn secret_from_manifest(doc: &Json) -> Result<(String, SecretData)> {
    let name = meta_str(doc, "name").ok_or_else(|| anyhow!("secret manifest has no metadata.name"))?;
    let mut out = SecretData::default();
    if let Some(m) = doc.get("stringData").and_then(|v| v.as_object()) {
        for (k, v) in m {
            let s = v.as_str().ok_or_else(|| anyhow!("stringData.{k} is not a string"))?;
            out.0.insert(k.clone(), s.as_bytes().to_vec());
        }
    }
    if let Some(m) = doc.get("data").and_then(|v| v.as_object()) {
        for (k, v) in m {
            let s = v.as_str().ok_or_else(|| anyhow!("data.{k} is not a string"))?;
            let bytes = STANDARD.decode(s.trim()).with_context(|| format!("data.{k} is not base64"))?;
            out.0.insert(k.clone(), bytes);
        }
    }
    Ok((name.to_string(), out))
}
