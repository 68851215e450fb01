//! Parses the `provider_config_string` bootstrap contract (spec §6):
//! `name:keywords_hex:level:filter[,…]`, with `"*"` as a catch-all
//! shortcut for every provider at `KEYWORDS_ALL`/`Verbose`.

use anyhow::{bail, Context};
use eventpipe::{Level, SessionProvider};

pub fn parse_provider_config_string(spec: &str) -> anyhow::Result<Vec<SessionProvider>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    if spec == "*" {
        return Ok(vec![SessionProvider::catch_all()]);
    }

    spec.split(',').map(parse_one).collect()
}

fn parse_one(entry: &str) -> anyhow::Result<SessionProvider> {
    let entry = entry.trim();
    if entry == "*" {
        return Ok(SessionProvider::catch_all());
    }

    let mut parts = entry.splitn(4, ':');
    let name = parts.next().filter(|s| !s.is_empty()).with_context(|| format!("missing provider name in '{entry}'"))?;
    let keywords_str = parts.next().unwrap_or("0");
    let level_str = parts.next().unwrap_or("4");
    let filter = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

    let keywords = parse_keywords(keywords_str).with_context(|| format!("invalid keywords in '{entry}'"))?;
    let level = parse_level(level_str).with_context(|| format!("invalid level in '{entry}'"))?;

    Ok(SessionProvider {
        provider_name: name.to_string(),
        keywords,
        level,
        filter_data: filter,
    })
}

fn parse_keywords(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16).map_err(Into::into)
}

fn parse_level(s: &str) -> anyhow::Result<Level> {
    let s = s.trim();
    let level = match s.parse::<u8>() {
        Ok(n) => match n {
            0 => Level::LogAlways,
            1 => Level::Critical,
            2 => Level::Error,
            3 => Level::Warning,
            4 => Level::Informational,
            5 => Level::Verbose,
            _ => bail!("level out of range 0..=5: {n}"),
        },
        Err(_) => match s.to_ascii_lowercase().as_str() {
            "logalways" => Level::LogAlways,
            "critical" => Level::Critical,
            "error" => Level::Error,
            "warning" => Level::Warning,
            "informational" => Level::Informational,
            "verbose" => Level::Verbose,
            other => bail!("unrecognized level: {other}"),
        },
    };
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_all_shortcut() {
        let providers = parse_provider_config_string("*").unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].provider_name, "*");
        assert_eq!(providers[0].keywords, eventpipe_wire::KEYWORDS_ALL);
        assert!(matches!(providers[0].level, Level::Verbose));
    }

    #[test]
    fn single_provider_with_hex_keywords_and_numeric_level() {
        let providers = parse_provider_config_string("MyProvider:0x1F:4").unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].provider_name, "MyProvider");
        assert_eq!(providers[0].keywords, 0x1F);
        assert!(matches!(providers[0].level, Level::Informational));
        assert!(providers[0].filter_data.is_none());
    }

    #[test]
    fn multiple_providers_comma_separated() {
        let providers = parse_provider_config_string("A:1:5,B:2:3:somefilter").unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].provider_name, "A");
        assert_eq!(providers[1].provider_name, "B");
        assert_eq!(providers[1].filter_data.as_deref(), Some("somefilter"));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(parse_provider_config_string(":1:5").is_err());
    }

    #[test]
    fn empty_string_yields_no_providers() {
        assert!(parse_provider_config_string("").unwrap().is_empty());
    }
}
