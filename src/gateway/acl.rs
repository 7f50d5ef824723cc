//! 访问控制：每种 Agent 的工具白名单

use crate::planning::AgentType;

const FILE_TOOLS: &[&str] = &[
    "list_files",
    "list_folders",
    "get_file_info",
    "create_folder",
    "rename_file",
    "rename_folder",
    "move_file",
    "move_folder",
    "trash_file",
    "trash_folder",
    "restore_file",
    "restore_folder",
    "delete_file",
    "delete_folder",
    "empty_trash",
    "star_file",
    "unstar_file",
    "star_folder",
    "unstar_folder",
];

const DOCUMENT_TOOLS: &[&str] = &[
    "get_file_info",
    "read_document",
    "patch_document",
    "write_document",
];

const SEARCH_TOOLS: &[&str] = &["list_files", "search_files", "semantic_search", "index_file"];

const GENERAL_TOOLS: &[&str] = &[
    "list_files",
    "list_folders",
    "get_file_info",
    "read_document",
    "search_files",
];

pub fn allowed_tools(agent: AgentType) -> &'static [&'static str] {
    match agent {
        AgentType::File => FILE_TOOLS,
        AgentType::Document => DOCUMENT_TOOLS,
        AgentType::Search => SEARCH_TOOLS,
        AgentType::General => GENERAL_TOOLS,
    }
}

/// 专门负责该工具的 Agent（通用 Agent 只作兜底）
pub fn owner_of(tool_name: &str) -> Option<AgentType> {
    [AgentType::File, AgentType::Document, AgentType::Search, AgentType::General]
        .into_iter()
        .find(|agent| allowed_tools(*agent).contains(&tool_name))
}

/// 工具不在白名单内时返回拒绝原因（指向正确的 Agent）
pub fn check_acl(agent: AgentType, tool_name: &str) -> Result<(), String> {
    if allowed_tools(agent).contains(&tool_name) {
        return Ok(());
    }
    Err(match owner_of(tool_name) {
        Some(owner) => format!(
            "Tool '{tool_name}' is not available to the {agent} agent; it belongs to the {owner} agent. \
             Describe what is needed in your answer instead of calling it."
        ),
        None => format!(
            "Tool '{tool_name}' is not available to the {agent} agent. Available tools: {}",
            allowed_tools(agent).join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::risk::{classify, RiskLevel};

    #[test]
    fn test_file_agent_may_delete() {
        assert!(check_acl(AgentType::File, "delete_folder").is_ok());
    }

    #[test]
    fn test_denial_points_to_owner() {
        let reason = check_acl(AgentType::Search, "delete_folder").unwrap_err();
        assert!(reason.contains("file agent"));
        let reason = check_acl(AgentType::General, "write_document").unwrap_err();
        assert!(reason.contains("document agent"));
    }

    #[test]
    fn test_unknown_tool_lists_allowed() {
        let reason = check_acl(AgentType::Search, "send_email").unwrap_err();
        assert!(reason.contains("semantic_search"));
    }

    #[test]
    fn test_general_is_read_only() {
        for tool in allowed_tools(AgentType::General) {
            assert_eq!(classify(tool), RiskLevel::Safe);
        }
    }
}
