pub mod error;
pub mod online;
pub mod session;
pub mod session_manager;
pub mod task;
pub mod task_processor;
pub mod task_queue;
pub mod timer;

pub use error::CairnError;
pub use online::{ContentManager, FetchOnlineContent, Layout, OnlineService, OnlineServiceHandle};
pub use session::{INVALID_OBJECT_ID, MAX_UI_UPDATE_IDS, ObjectId, Session, SessionId, UiUpdates};
pub use session_manager::{SessionManager, SessionManagerConfig};
pub use task::{Task, TaskContext, TaskId, TaskPayload, TaskStatus, TaskType};
pub use task_processor::TaskProcessor;
pub use task_queue::{Dequeued, TaskQueue};
pub use timer::{MIN_TIMER_INTERVAL, SubscriptionId, Timer, TimerCallback, TokioTimer};
