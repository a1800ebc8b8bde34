//! Filesystem-safe encoding of agent IDs for `.messages/` file names
//! (`spec.md` §6: "In file names, `/` in an agent ID is encoded as `--`").

pub fn encode_agent_id(agent_id: &str) -> String {
    agent_id.replace('/', "--")
}

pub fn agent_log_filename(agent_id: &str) -> String {
    format!("agent--{}.jsonl", encode_agent_id(agent_id))
}

pub fn session_log_filename(agent_id: &str, session_id: &str) -> String {
    format!(
        "session--{}--{}.jsonl",
        encode_agent_id(agent_id),
        session_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_nested_agent_id() {
        assert_eq!(encode_agent_id("research/deep"), "research--deep");
        assert_eq!(
            agent_log_filename("research/deep"),
            "agent--research--deep.jsonl"
        );
        assert_eq!(
            session_log_filename("research/deep", "main"),
            "session--research--deep--main.jsonl"
        );
    }
}
