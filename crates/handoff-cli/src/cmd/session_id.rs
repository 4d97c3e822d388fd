use handoff_core::types::SessionId;

use crate::output::print_json;

pub fn run(identity: &[String], json: bool) -> anyhow::Result<()> {
    let id = SessionId::from_identity(identity);
    if json {
        print_json(&serde_json::json!({
            "sessionId": id,
            "context": id.context_name(),
        }))?;
    } else {
        println!("{id}");
    }
    Ok(())
}
