//! Weight-format table: maps `general.file_type` codes to quantization names.
//!
//! Codes 0..=38 follow llama.cpp's `llama_ftype`. The sparse 145..=156 range
//! covers the extended quant types written by ik_llama.cpp builds.

static FILE_TYPES: &[(u32, &str)] = &[
    (0, "F32"),
    (1, "F16"),
    (2, "Q4_0"),
    (3, "Q4_1"),
    (4, "Q4_1_SOME_F16"),
    (5, "Q4_2"),
    (6, "Q4_3"),
    (7, "Q8_0"),
    (8, "Q5_0"),
    (9, "Q5_1"),
    (10, "Q2_K"),
    (11, "Q3_K_S"),
    (12, "Q3_K_M"),
    (13, "Q3_K_L"),
    (14, "Q4_K_S"),
    (15, "Q4_K_M"),
    (16, "Q5_K_S"),
    (17, "Q5_K_M"),
    (18, "Q6_K"),
    (19, "IQ2_XXS"),
    (20, "IQ2_XS"),
    (21, "Q2_K_S"),
    (22, "IQ3_XS"),
    (23, "IQ3_XXS"),
    (24, "IQ1_S"),
    (25, "IQ4_NL"),
    (26, "IQ3_S"),
    (27, "IQ3_M"),
    (28, "IQ2_S"),
    (29, "IQ2_M"),
    (30, "IQ4_XS"),
    (31, "IQ1_M"),
    (32, "BF16"),
    (33, "Q4_0_4_4"),
    (34, "Q4_0_4_8"),
    (35, "Q4_0_8_8"),
    (36, "TQ1_0"),
    (37, "TQ2_0"),
    (38, "MXFP4_MOE"),
    (145, "IQ4_KS"),
    (146, "IQ3_KL"),
    (147, "IQ2_KS"),
    (148, "IQ4_KSS"),
    (149, "Q8_KV"),
    (150, "IQ5_KS"),
    (151, "IQ2_KT"),
    (152, "IQ3_KT"),
    (153, "IQ4_KT"),
    (154, "IQ3_KS"),
    (155, "IQ2_KL"),
    (156, "IQ1_KT"),
];

/// Canonical name for a file-type code, if known.
pub fn file_type_name(code: u64) -> Option<&'static str> {
    FILE_TYPES
        .iter()
        .find(|(c, _)| *c as u64 == code)
        .map(|(_, name)| *name)
}

/// Display label: the canonical name, or `Unknown (<code>)`.
pub fn weight_format_label(code: u64) -> String {
    match file_type_name(code) {
        Some(name) => name.to_string(),
        None => format!("Unknown ({})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_range_is_complete() {
        for code in 0..=38 {
            assert!(file_type_name(code).is_some(), "missing code {}", code);
        }
    }

    #[test]
    fn known_codes() {
        assert_eq!(weight_format_label(15), "Q4_K_M");
        assert_eq!(weight_format_label(1), "F16");
        assert_eq!(weight_format_label(150), "IQ5_KS");
    }

    #[test]
    fn gaps_fall_back_to_unknown() {
        assert_eq!(weight_format_label(39), "Unknown (39)");
        assert_eq!(weight_format_label(100), "Unknown (100)");
        assert_eq!(weight_format_label(157), "Unknown (157)");
    }
}
