//! Build script for cothread-runtime
//!
//! Compile-time defaults for `SchedulerConfig`:
//! 1. Start with library defaults
//! 2. If COT_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/cot_merged_config.rs
//!
//! Environment variables read at runtime (`SchedulerConfig::from_env`) still
//! override whatever ends up baked in here.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "NUM_WORKERS",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "256 * 1024",
    },
    ConfigParam {
        name: "CHUNK_COUNT",
        rust_type: "usize",
        default_value: "8",
    },
    ConfigParam {
        name: "MAX_CHUNK_SIZE",
        rust_type: "usize",
        default_value: "128",
    },
    ConfigParam {
        name: "EPOLL_BATCH_SIZE",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "TIMER_BATCH_SIZE",
        rust_type: "usize",
        default_value: "128",
    },
    ConfigParam {
        name: "MAX_IDLE_SLEEP_US",
        rust_type: "u64",
        default_value: "1000",
    },
    ConfigParam {
        name: "DEBUG_FLAGS",
        rust_type: "u64",
        default_value: "0",
    },
];

fn main() {
    let Ok(out_dir) = env::var("OUT_DIR") else {
        println!("cargo:warning=OUT_DIR not set, skipping config generation");
        return;
    };
    let dest_path = Path::new(&out_dir).join("cot_merged_config.rs");

    let mut config: HashMap<&'static str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("COT_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);

        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read COT_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }

    println!("cargo:rerun-if-env-changed=COT_CONFIG_RS");
    println!("cargo:rerun-if-changed=build.rs");

    let output = generate_config(&config);
    if let Err(e) = fs::write(&dest_path, output) {
        panic!("failed to write {}: {}", dest_path.display(), e);
    }
}

/// Parse user's config file and merge known values into the map
fn parse_and_merge(content: &str, config: &mut HashMap<&'static str, String>) {
    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with("//") || !line.starts_with("pub const ") {
            continue;
        }

        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };

        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

/// Parse `pub const NAME: TYPE = VALUE;` into (name, value)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

/// Generate the merged config Rust file
fn generate_config(config: &HashMap<&'static str, String>) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    if env::var("COT_CONFIG_RS").is_ok() {
        output.push_str(" and user's cot_config.rs");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        let result = parse_const_line("pub const CHUNK_COUNT: usize = 16;");
        assert_eq!(result, Some(("CHUNK_COUNT".into(), "16".into())));

        let result = parse_const_line("pub const STACK_SIZE: usize = 64 * 1024;");
        assert_eq!(result, Some(("STACK_SIZE".into(), "64 * 1024".into())));
    }

    #[test]
    fn test_parse_and_merge() {
        let mut config: HashMap<&'static str, String> = HashMap::new();
        config.insert("NUM_WORKERS", "4".into());

        let user_config = r#"
            // Custom config
            pub const NUM_WORKERS: usize = 2;
            pub const MAX_IDLE_SLEEP_US: u64 = 500;
        "#;

        parse_and_merge(user_config, &mut config);

        assert_eq!(config.get("NUM_WORKERS"), Some(&"2".to_string()));
        assert_eq!(config.get("MAX_IDLE_SLEEP_US"), Some(&"500".to_string()));
    }
}
