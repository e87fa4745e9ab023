//! Built-in gimmick cores.

use super::{GimmickContext, GimmickCore, GimmickOutcome};
use crate::llm::{LlmMessage, ToolDefinition};
use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

/// Rolls `count` dice with `sides` sides.
pub struct DiceCore;

impl DiceCore {
    const MAX_DICE: i64 = 20;
    const MAX_SIDES: i64 = 1000;
}

fn int_param(params: &Value, key: &str, default: i64) -> anyhow::Result<i64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n.as_i64().with_context(|| format!("'{}' must be an integer", key)),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .with_context(|| format!("'{}' must be an integer", key)),
        Some(other) => bail!("'{}' must be an integer, got {}", key, other),
    }
}

#[async_trait]
impl GimmickCore for DiceCore {
    fn name(&self) -> &'static str {
        "dice"
    }

    fn describe(&self) -> ToolDefinition {
        ToolDefinition {
            name: "dice".to_string(),
            description: "Roll dice and announce the result".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "count": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": Self::MAX_DICE,
                        "default": 1,
                        "description": "Number of dice",
                    },
                    "sides": {
                        "type": "integer",
                        "minimum": 2,
                        "maximum": Self::MAX_SIDES,
                        "default": 6,
                        "description": "Sides per die",
                    },
                },
            }),
        }
    }

    async fn execute(&self, ctx: &GimmickContext, params: Value) -> anyhow::Result<GimmickOutcome> {
        let count = int_param(&params, "count", 1)?;
        let sides = int_param(&params, "sides", 6)?;
        if !(1..=Self::MAX_DICE).contains(&count) {
            bail!("cannot roll {} dice", count);
        }
        if !(2..=Self::MAX_SIDES).contains(&sides) {
            bail!("a die cannot have {} sides", sides);
        }

        let rolls: Vec<i64> = {
            let mut rng = rand::thread_rng();
            (0..count).map(|_| rng.gen_range(1..=sides)).collect()
        };
        let total: i64 = rolls.iter().sum();
        debug!(gimmick_id = %ctx.gimmick.id, ?rolls, "Rolled dice");

        let faces = rolls
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(GimmickOutcome {
            message: Some(format!(
                "{} rolled {}d{}: {} (total {})",
                ctx.executor, count, sides, faces, total
            )),
            data: Some(json!({ "rolls": rolls, "total": total })),
        })
    }
}

/// Answers a question by asking the language model.
pub struct OracleCore;

#[async_trait]
impl GimmickCore for OracleCore {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn describe(&self) -> ToolDefinition {
        ToolDefinition::with_string_args(
            "oracle",
            "Ask the oracle a question",
            &[("question", "The question to ask")],
        )
    }

    async fn execute(&self, ctx: &GimmickContext, params: Value) -> anyhow::Result<GimmickOutcome> {
        let question = params
            .get("question")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .context("the oracle needs a question")?;

        let messages = [
            LlmMessage::system(format!(
                "You are {}, {}. Answer in one or two sentences.",
                ctx.gimmick.name, ctx.gimmick.description
            )),
            LlmMessage::user(question),
        ];
        let response = ctx.llm.generate(&messages, &ctx.llm_options).await?;

        let answer = response.content.trim();
        if answer.is_empty() {
            bail!("the oracle stayed silent");
        }
        Ok(GimmickOutcome::message(answer))
    }
}
