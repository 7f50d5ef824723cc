//! 风险分级：按工具名静态查表（未知工具按 moderate 处理）

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Moderate,
    Dangerous,
}

const SAFE: &[&str] = &[
    "list_files",
    "list_folders",
    "get_file_info",
    "read_document",
    "search_files",
    "semantic_search",
    "star_file",
    "unstar_file",
    "star_folder",
    "unstar_folder",
];

const DANGEROUS: &[&str] = &["delete_file", "delete_folder", "empty_trash"];

pub fn classify(tool_name: &str) -> RiskLevel {
    if DANGEROUS.contains(&tool_name) {
        RiskLevel::Dangerous
    } else if SAFE.contains(&tool_name) {
        RiskLevel::Safe
    } else {
        RiskLevel::Moderate
    }
}

/// 审批请求中展示给用户的说明
pub fn danger_reason(tool_name: &str, args: &Value) -> String {
    let id = |key: &str| {
        args.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    match tool_name {
        "delete_file" => format!("Permanently delete file {} (cannot be undone)", id("fileId")),
        "delete_folder" => format!(
            "Permanently delete folder {} and everything inside it (cannot be undone)",
            id("folderId")
        ),
        "empty_trash" => "Permanently delete everything in the trash (cannot be undone)".to_string(),
        other => format!("{other} is classified as dangerous"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("search_files"), RiskLevel::Safe);
        assert_eq!(classify("move_file"), RiskLevel::Moderate);
        assert_eq!(classify("delete_folder"), RiskLevel::Dangerous);
        assert_eq!(classify("format_disk"), RiskLevel::Moderate);
        assert!(RiskLevel::Dangerous > RiskLevel::Moderate);
    }

    #[test]
    fn test_danger_reason_names_target() {
        let reason = danger_reason("delete_folder", &serde_json::json!({"folderId": "fd-7"}));
        assert!(reason.contains("fd-7"));
    }
}
