//! Agents file: one `publicAddress[,privateAddress]` per line.

use sim_types::AgentData;

use crate::ParseError;

/// Parse an agents file into agent data, assigning indices from 1.
///
/// Blank lines and `#` comments are skipped.
pub fn parse_agents_file(text: &str) -> Result<Vec<AgentData>, ParseError> {
    let mut agents = Vec::new();
    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split(',').map(str::trim);
        let public = parts.next().unwrap_or_default();
        let private = parts.next().filter(|p| !p.is_empty()).unwrap_or(public);
        if public.is_empty() || parts.next().is_some() {
            return Err(ParseError::InvalidLine {
                line: number + 1,
                reason: format!("expected publicAddress[,privateAddress], got '{line}'"),
            });
        }
        agents.push(AgentData::new(agents.len() as u32 + 1, public, private));
    }
    if agents.is_empty() {
        return Err(ParseError::Empty("agents file"));
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_and_private_addresses() {
        let agents = parse_agents_file("10.0.0.1\n# comment\n\n10.0.0.2, 192.168.0.2\n").unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0], AgentData::new(1, "10.0.0.1", "10.0.0.1"));
        assert_eq!(agents[1], AgentData::new(2, "10.0.0.2", "192.168.0.2"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(
            parse_agents_file("a,b,c"),
            Err(ParseError::InvalidLine { line: 1, .. })
        ));
        assert!(parse_agents_file(",10.0.0.1").is_err());
        assert_eq!(parse_agents_file(""), Err(ParseError::Empty("agents file")));
    }
}
