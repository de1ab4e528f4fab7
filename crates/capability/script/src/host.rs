//! 注入脚本的宿主函数。

use domain::{DeviceData, PointData};
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Result as JsResult, Value as JsValue};
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::PluginCache;
use crate::sandbox::ScriptPublisher;

pub(crate) fn register_host_api<'js>(
    ctx: &Ctx<'js>,
    key: &str,
    cache: PluginCache,
    publisher: ScriptPublisher,
) -> JsResult<()> {
    let globals = ctx.globals();

    let set_cache = cache.clone();
    globals.set(
        "setCache",
        Function::new(ctx.clone(), move |key: String, value: String| {
            set_cache.set(key, value);
        })?,
    )?;

    let get_cache = cache;
    globals.set(
        "getCache",
        Function::new(ctx.clone(), move |key: String| get_cache.get(&key))?,
    )?;

    let script_key = key.to_string();
    globals.set(
        "publish",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, device_sn: String, points: JsValue<'js>| -> JsResult<bool> {
                let text = match ctx.json_stringify(points)? {
                    Some(text) => text.to_string()?,
                    None => return Ok(false),
                };
                let values = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => map
                        .into_iter()
                        .map(|(name, value)| PointData::new(name, value))
                        .collect::<Vec<_>>(),
                    _ => {
                        warn!(target: "gw.script", key = %script_key, device_sn = %device_sn, "publish expects an object of point values");
                        return Ok(false);
                    }
                };
                let sent = publisher.send(DeviceData { device_sn, values }).is_ok();
                if !sent {
                    warn!(target: "gw.script", key = %script_key, "publish channel closed");
                }
                Ok(sent)
            },
        )?,
    )?;

    let console = Object::new(ctx.clone())?;
    let log_key = key.to_string();
    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<String>| {
            info!(target: "gw.script", key = %log_key, "{}", args.0.join(" "));
        })?,
    )?;
    let warn_key = key.to_string();
    console.set(
        "warn",
        Function::new(ctx.clone(), move |args: Rest<String>| {
            warn!(target: "gw.script", key = %warn_key, "{}", args.0.join(" "));
        })?,
    )?;
    globals.set("console", console)?;

    Ok(())
}
