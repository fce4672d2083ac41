//! Built-in gateway methods.

pub mod chat;
pub mod config;
pub mod status;

use crate::rpc::MethodTable;

/// Register every built-in method on `table`.
pub fn register(table: &mut MethodTable) {
    table.register("health", status::health);
    table.register("channels.status", status::channels_status);
    table.register("session.list", status::session_list);
    table.register("config.get", config::get);
    table.register("config.set", config::set);
    table.register("chat.send", chat::send);
    table.register("chat.stream", chat::stream);
}
