//! Section flattening.
//!
//! Two rewrites run over each section before the lifecycle loader sees it:
//!
//! 1. A block carrying a `routes` array is a grouping node. It is replaced
//!    by its children, depth-first, each child deep-merged over the
//!    parent's remaining fields (child wins; `match` objects merge
//!    key-wise). Nested route trees become one linear, ordered route list.
//! 2. An inline `logger` / `rateLimit` / `balancer` / `store` / `stream`
//!    object is hoisted to a standalone block with a synthesized id, and
//!    the field is rewritten to the matching `<field>Id` reference. The
//!    loader then only ever deals with flat blocks and id references.

use serde_json::Value;

use crate::component::registry::Block;
use crate::error::{Error, Result};

const GROUP_KEY: &str = "routes";

/// Inline-object fields and the id reference each rewrites to.
const HOISTABLE: [(&str, &str); 5] = [
    ("logger", "loggerId"),
    ("rateLimit", "rateLimitId"),
    ("balancer", "balancerId"),
    ("store", "storeId"),
    ("stream", "streamId"),
];

/// Flatten one section into its final, ordered block list.
pub fn flatten_section(items: Vec<Value>) -> Result<Vec<Block>> {
    let mut flat = Vec::new();
    for item in items {
        let block = as_block(item)?;
        flatten_into(block, &mut flat)?;
    }

    let mut out = Vec::new();
    let mut inline_counter = 0usize;
    for block in flat {
        hoist_inline(block, &mut inline_counter, &mut out)?;
    }
    Ok(out)
}

fn as_block(value: Value) -> Result<Block> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Config(format!(
            "component block must be an object, got: {other}"
        ))),
    }
}

fn flatten_into(mut block: Block, out: &mut Vec<Block>) -> Result<()> {
    let Some(children) = block.remove(GROUP_KEY) else {
        out.push(block);
        return Ok(());
    };
    let children = match children {
        Value::Array(items) => items,
        other => {
            return Err(Error::Config(format!(
                "routes must be an array, got: {other}"
            )))
        }
    };
    for child in children {
        let child = as_block(child)?;
        flatten_into(merge_blocks(&block, child), out)?;
    }
    Ok(())
}

/// Child fields win over parent fields; `match` objects merge key-wise so a
/// parent can pin a hostname while children add their own conditions.
fn merge_blocks(parent: &Block, child: Block) -> Block {
    let mut merged = parent.clone();
    for (key, value) in child {
        if key == "match" {
            if let (Some(Value::Object(base)), Value::Object(incoming)) =
                (merged.get_mut(&key), &value)
            {
                for (k, v) in incoming {
                    base.insert(k.clone(), v.clone());
                }
                continue;
            }
        }
        merged.insert(key, value);
    }
    merged
}

fn hoist_inline(mut block: Block, counter: &mut usize, out: &mut Vec<Block>) -> Result<()> {
    for (field, reference) in HOISTABLE {
        let mut hoisted = match block.remove(field) {
            Some(Value::Object(map)) => map,
            Some(other) => {
                // An id reference given under the short field name.
                block.insert(field.into(), other);
                continue;
            }
            None => continue,
        };
        let id = match hoisted.get("id").and_then(Value::as_str) {
            Some(existing) => existing.to_string(),
            None => {
                *counter += 1;
                let id = format!("__inline-{counter}");
                hoisted.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        block.insert(reference.into(), Value::String(id));
        // Hoisted blocks may themselves carry inline blocks.
        hoist_inline(hoisted, counter, out)?;
    }
    out.push(block);
    Ok(())
}
