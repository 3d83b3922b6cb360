mod webhook_replay;

pub use webhook_replay::WebhookReplayWorker;
