//! Per-turn performance statistics from llama-server's `usage`/`timings`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shown by front-ends for any field the server did not report.
pub const STAT_UNAVAILABLE: &str = "Unavailable";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnStats {
    pub input_ms: Option<f64>,
    pub gen_ms: Option<f64>,
    pub total_ms: Option<f64>,
    pub input_tokens: Option<u64>,
    pub gen_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub tokens_per_second: Option<f64>,
}

/// One labelled statistic for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatField {
    pub label: &'static str,
    pub value: Option<f64>,
    pub unit: &'static str,
}

impl TurnStats {
    /// Derive stats from a raw streaming chunk. `None` when the chunk carries
    /// neither `usage` nor `timings`.
    pub fn from_chunk(chunk: &Value) -> Option<TurnStats> {
        let usage = chunk.get("usage").filter(|v| v.is_object());
        let timings = chunk.get("timings").filter(|v| v.is_object());
        if usage.is_none() && timings.is_none() {
            return None;
        }

        let f = |obj: Option<&Value>, key: &str| obj.and_then(|o| o.get(key)).and_then(Value::as_f64);
        let n = |obj: Option<&Value>, key: &str| obj.and_then(|o| o.get(key)).and_then(Value::as_u64);

        let input_ms = f(timings, "prompt_ms");
        let gen_ms = f(timings, "predicted_ms");
        let input_tokens = n(usage, "prompt_tokens").or_else(|| n(timings, "prompt_n"));
        let gen_tokens = n(usage, "completion_tokens").or_else(|| n(timings, "predicted_n"));
        let total_tokens = n(usage, "total_tokens").or_else(|| Some(input_tokens? + gen_tokens?));
        let tokens_per_second = f(timings, "predicted_per_second").or_else(|| {
            let ms = gen_ms.filter(|ms| *ms > 0.0)?;
            Some(gen_tokens? as f64 * 1000.0 / ms)
        });

        Some(TurnStats {
            input_ms,
            gen_ms,
            total_ms: input_ms.zip(gen_ms).map(|(a, b)| a + b),
            input_tokens,
            gen_tokens,
            total_tokens,
            tokens_per_second,
        })
    }

    /// Fold a later report into this one; fields it carries win.
    pub fn absorb(&mut self, later: TurnStats) {
        self.input_ms = later.input_ms.or(self.input_ms);
        self.gen_ms = later.gen_ms.or(self.gen_ms);
        self.total_ms = later.total_ms.or(self.total_ms);
        self.input_tokens = later.input_tokens.or(self.input_tokens);
        self.gen_tokens = later.gen_tokens.or(self.gen_tokens);
        self.total_tokens = later.total_tokens.or(self.total_tokens);
        self.tokens_per_second = later.tokens_per_second.or(self.tokens_per_second);
    }

    pub fn fields(&self) -> [StatField; 7] {
        let stat = |label: &'static str, value: Option<f64>, unit: &'static str| StatField {
            label,
            value,
            unit,
        };
        [
            stat("Input time", self.input_ms, "ms"),
            stat("Generation time", self.gen_ms, "ms"),
            stat("Total time", self.total_ms, "ms"),
            stat("Input tokens", self.input_tokens.map(|v| v as f64), ""),
            stat("Generated tokens", self.gen_tokens.map(|v| v as f64), ""),
            stat("Total tokens", self.total_tokens.map(|v| v as f64), ""),
            stat("Speed", self.tokens_per_second, "tok/s"),
        ]
    }
}
