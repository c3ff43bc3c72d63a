//! Tests for configuration types

#[cfg(test)]
mod tests {
    use candle_core::DType;

    use crate::config::CacheConfig;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_padding, 1);
        assert!(!config.permuted_v);
        assert_eq!(config.mask_dtype, DType::F32);
    }

    #[test]
    fn test_config_validation_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());

        let config = CacheConfig {
            cache_padding: 32,
            permuted_v: true,
            mask_dtype: DType::F16,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_padding() {
        let config = CacheConfig {
            cache_padding: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.validate().unwrap_err().contains("cache_padding"));
    }

    #[test]
    fn test_config_clone_eq() {
        let config = CacheConfig {
            cache_padding: 16,
            permuted_v: true,
            mask_dtype: DType::BF16,
        };
        assert_eq!(config.clone(), config);
    }
}
