//! Id command: print the agent identity, creating it on first use.

use ant_agent::{AgentSettings, AntClient};

use crate::Result;

pub fn run(settings: AgentSettings) -> Result<()> {
    println!("{}", identity(settings)?);
    Ok(())
}

fn identity(settings: AgentSettings) -> Result<String> {
    Ok(AntClient::new(settings).identity()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings::new(dir.path().join("home"));

        let first = identity(settings.clone()).unwrap();
        let second = identity(settings).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("home").join("ant.id")).unwrap(),
            first
        );
    }
}
