use crate::config::ModelConfig;

/// Tiny Llama-style config: 4 layers, 16 hidden, 4 query heads over 2 KV
/// heads. Splits evenly over 2 TP ranks and 2 or 4 stages.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        num_hidden_layers: 4,
        hidden_size: 16,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        head_dim: 4,
        intermediate_size: 24,
        vocab_size: 40,
        max_position_embeddings: 32,
        max_positions: None,
        norm_eps: 1e-6,
        hidden_act: "silu".to_string(),
        rope_theta: 10000.0,
        bos_token_id: 1,
        eos_token_id: 2,
    }
}

/// Tiny GPT-style config with a two-layer GELU feed-forward.
pub fn tiny_gelu_config() -> ModelConfig {
    ModelConfig {
        hidden_act: "gelu".to_string(),
        num_key_value_heads: 4,
        intermediate_size: 32,
        ..tiny_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_configs_finalize() {
        let config = tiny_config().finalize().unwrap();
        assert_eq!(config.gqa_groups(), 2);
        assert_eq!(config.max_positions(), 32);
        let gelu = tiny_gelu_config().finalize().unwrap();
        assert!(!gelu.activation().unwrap().is_gated());
    }
}
