//! Canonical task catalog and per-user-type task pools.
//!
//! Each user type (`daily`, `starter`, `quiz`) has a fixed pool of recurring
//! tasks. A stored task-configuration document is normalized against the
//! pool: missing tasks are filled in from the template as disabled, tasks
//! outside the pool are dropped, and stored overrides are preserved.

pub mod next_time;

use serde_json::{Map, Value, json};

pub const USER_TYPE_DAILY: &str = "daily";
pub const USER_TYPE_STARTER: &str = "starter";
pub const USER_TYPE_QUIZ: &str = "quiz";

/// Task pool for everyday maintenance accounts.
const DAILY_TASKS: &[&str] = &[
    "foster_care",
    "bounty_hunt",
    "assist_battles",
    "coop_raid",
    "explore_breakthrough",
    "realm_card_craft",
    "friend_requests",
    "login_gift",
    "collect_mail",
    "tower_climb",
    "demon_parade",
    "earth_spirits",
    "dojo_challenge",
    "guild_shop",
    "guild_coins",
    "daily_summon",
    "weekly_shop",
    "hidden_tales",
    "sign_in",
    "soul_runs",
    "weekly_share",
    "arena_duels",
    "quiz_guess",
];

/// Task pool for fresh account bootstrapping.
const STARTER_TASKS: &[&str] = &[
    "starter_rent_unit",
    "starter_claim_rewards",
    "starter_tutorial",
    "starter_exp_dungeon",
    "starter_unit_training",
    "explore_breakthrough",
    "tower_climb",
    "sign_in",
    "weekly_shop",
    "guild_shop",
    "guild_coins",
    "collect_mail",
    "friend_requests",
    "login_gift",
    "daily_summon",
    "arena_duels",
    "quiz_guess",
];

/// Quiz-only accounts run a single task.
const QUIZ_TASKS: &[&str] = &["quiz_guess"];

/// Default template for every known task.
fn template_for(task: &str) -> Option<Value> {
    let tpl = match task {
        "foster_care" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "interval_6h"}),
        "bounty_hunt" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "assist_battles" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "coop_raid" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "coop_window"}),
        "explore_breakthrough" => json!({"enabled": true, "sub_explore": true, "sub_breakthrough": true, "stamina_threshold": 1000, "difficulty": "normal", "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "interval_8h"}),
        "realm_card_craft" => json!({"enabled": true, "explore_count": 0, "next_time_rule": "daily_reset"}),
        "friend_requests" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "login_gift" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "collect_mail" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "tower_climb" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "demon_parade" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "interval_6h"}),
        "earth_spirits" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "dojo_challenge" => json!({"enabled": false, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "guild_shop" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "weekly_monday"}),
        "guild_coins" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "daily_summon" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "weekly_shop" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "weekly_monday"}),
        "hidden_tales" => json!({"enabled": false, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "sign_in" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "soul_runs" => json!({"enabled": false, "count": 0, "difficulty": 10, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "interval_8h"}),
        "weekly_share" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "weekly_7d"}),
        "arena_duels" => json!({"enabled": false, "target_score": 0, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "daily_reset"}),
        "quiz_guess" => json!({"enabled": true, "next_time": "2020-01-01 00:00", "fail_delay": 30, "next_time_rule": "interval_2h_window"}),
        "starter_rent_unit" => json!({"enabled": true, "next_time_rule": "on_demand"}),
        "starter_claim_rewards" => json!({"enabled": true, "fail_delay": 30, "next_time_rule": "interval_6h"}),
        "starter_tutorial" => json!({"enabled": true, "next_time_rule": "on_demand"}),
        "starter_exp_dungeon" => json!({"enabled": true, "fail_delay": 30, "next_time_rule": "interval_8h"}),
        "starter_unit_training" => json!({"enabled": true, "fail_delay": 30, "next_time_rule": "interval_8h"}),
        _ => return None,
    };
    Some(tpl)
}

/// Task pool allowed for a user type; unknown types fall back to `daily`.
pub fn tasks_for_user_type(user_type: &str) -> &'static [&'static str] {
    match user_type {
        USER_TYPE_STARTER => STARTER_TASKS,
        USER_TYPE_QUIZ => QUIZ_TASKS,
        _ => DAILY_TASKS,
    }
}

/// The schedule rule name for a task, empty when the task is unknown.
pub fn next_time_rule(task: &str) -> &'static str {
    match task {
        "foster_care" | "demon_parade" | "starter_claim_rewards" => "interval_6h",
        "explore_breakthrough" | "soul_runs" | "starter_exp_dungeon" | "starter_unit_training" => {
            "interval_8h"
        }
        "coop_raid" => "coop_window",
        "guild_shop" | "weekly_shop" => "weekly_monday",
        "weekly_share" => "weekly_7d",
        "quiz_guess" => "interval_2h_window",
        "starter_rent_unit" | "starter_tutorial" => "on_demand",
        "bounty_hunt" | "assist_battles" | "realm_card_craft" | "friend_requests"
        | "login_gift" | "collect_mail" | "tower_climb" | "earth_spirits" | "dojo_challenge"
        | "guild_coins" | "daily_summon" | "hidden_tales" | "sign_in" | "arena_duels" => {
            "daily_reset"
        }
        _ => "",
    }
}

/// Normalize a stored document against the user type's pool.
///
/// Tasks missing from the document are added from the template with
/// `enabled: false` (a new task never silently starts running); tasks not in
/// the pool are dropped; stored values win over template defaults.
pub fn normalize_task_config(stored: &Map<String, Value>, user_type: &str) -> Map<String, Value> {
    let mut normalized = Map::new();
    for task in tasks_for_user_type(user_type) {
        match stored.get(*task) {
            Some(Value::Object(existing)) => {
                let mut merged = match template_for(task) {
                    Some(Value::Object(tpl)) => tpl,
                    _ => Map::new(),
                };
                for (key, value) in existing {
                    merged.insert(key.clone(), value.clone());
                }
                normalized.insert((*task).to_string(), Value::Object(merged));
            }
            _ => {
                if let Some(Value::Object(mut tpl)) = template_for(task) {
                    tpl.insert("enabled".to_string(), Value::Bool(false));
                    normalized.insert((*task).to_string(), Value::Object(tpl));
                }
            }
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pools_only_contain_known_tasks() {
        for pool in [DAILY_TASKS, STARTER_TASKS, QUIZ_TASKS] {
            for task in pool {
                assert!(template_for(task).is_some(), "missing template for {task}");
                assert!(!next_time_rule(task).is_empty(), "missing rule for {task}");
            }
        }
    }

    #[test]
    fn unknown_user_type_falls_back_to_daily() {
        assert_eq!(tasks_for_user_type("bogus"), DAILY_TASKS);
        assert_eq!(tasks_for_user_type(USER_TYPE_QUIZ), QUIZ_TASKS);
    }

    #[test]
    fn normalize_fills_missing_tasks_disabled() {
        let stored = Map::new();
        let normalized = normalize_task_config(&stored, USER_TYPE_QUIZ);
        assert_eq!(normalized.len(), 1);
        let quiz = normalized.get("quiz_guess").unwrap();
        assert_eq!(quiz.get("enabled"), Some(&Value::Bool(false)));
        assert_eq!(
            quiz.get("next_time_rule").and_then(Value::as_str),
            Some("interval_2h_window")
        );
    }

    #[test]
    fn normalize_preserves_stored_overrides() {
        let mut stored = Map::new();
        stored.insert(
            "quiz_guess".to_string(),
            json!({"enabled": true, "next_time": "09:30"}),
        );
        let normalized = normalize_task_config(&stored, USER_TYPE_QUIZ);
        let quiz = normalized.get("quiz_guess").unwrap();
        assert_eq!(quiz.get("enabled"), Some(&Value::Bool(true)));
        assert_eq!(quiz.get("next_time").and_then(Value::as_str), Some("09:30"));
        // Template fields the user never set are still present.
        assert_eq!(quiz.get("fail_delay").and_then(Value::as_i64), Some(30));
    }

    #[test]
    fn normalize_drops_tasks_outside_pool() {
        let mut stored = Map::new();
        stored.insert("quiz_guess".to_string(), json!({"enabled": true}));
        stored.insert("soul_runs".to_string(), json!({"enabled": true}));
        let normalized = normalize_task_config(&stored, USER_TYPE_QUIZ);
        assert!(normalized.contains_key("quiz_guess"));
        assert!(!normalized.contains_key("soul_runs"));
    }
}
