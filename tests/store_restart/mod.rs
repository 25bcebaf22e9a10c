mod compaction_survives_restart;
mod history_replay_after_restart;
