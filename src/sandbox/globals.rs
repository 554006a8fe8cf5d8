//! Host bindings visible to capability code: `log` and `payload`.

use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Function, Value};
use tracing::info;

use crate::packager::Digest;

/// Target under which capability `log(...)` output is emitted.
pub const LOG_TARGET: &str = "capability";

/// Installs the two host globals. Nothing else from the host is reachable.
pub fn bind<'js>(ctx: &Ctx<'js>, digest: Digest, payload: &str) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("log", log_function(ctx, digest)?)?;
    globals.set("payload", payload)?;
    Ok(())
}

fn log_function<'js>(ctx: &Ctx<'js>, digest: Digest) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
        let line = args
            .0
            .into_iter()
            .map(|arg| display_value(&ctx, arg))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: LOG_TARGET, digest = %digest.short(), "{line}");
    })
}

/// String form of a logged value: strings as-is, everything else as JSON.
/// Never raises into the script.
pub fn display_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    match ctx.json_stringify(value) {
        Ok(Some(json)) => json.to_string().unwrap_or_default(),
        Ok(None) => "undefined".to_string(),
        Err(_) => {
            // Cyclic values and throwing toJSON(): clear the pending exception
            let _ = ctx.catch();
            "[unserializable]".to_string()
        }
    }
}
