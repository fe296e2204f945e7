use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

use js_sys::{Function, Promise};
use serde::Deserialize;
use tracing::{info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, spawn_local};
use web_sys::{Event, HtmlCanvasElement};

use slidescope_engine::tiles::TileUrlFn;
use slidescope_engine::{
    ImageSource, ImageSourceDescriptor, Palette, PointBuffer, Renderer, RendererConfig, TileKey,
    ViewUpdate,
};

use crate::decode::{f32_le, u16_le};
use crate::fetch::fetch_bytes;
use crate::gpu::WgpuDevice;
use crate::host::{BrowserHost, SharedState, ViewerState};

fn js_err(err: impl Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn busy() -> JsValue {
    JsValue::from_str("viewer is busy (called from inside a viewer callback)")
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value).map_err(js_err)
}

/// Geometry half of a source whose tile URLs come from a JS function.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceGeometry {
    width: u64,
    height: u64,
    tile_size: u32,
    max_tier_zoom: u8,
}

/// Accepts a descriptor as a JSON string, a descriptor object with a URL
/// template, or a geometry object with a `tileUrl(tier, x, y)` function.
fn parse_source(value: &JsValue) -> Result<ImageSource, JsValue> {
    if let Some(json) = value.as_string() {
        let descriptor = ImageSourceDescriptor::from_json(&json).map_err(js_err)?;
        return ImageSource::from_descriptor(descriptor).map_err(js_err);
    }
    let tile_url = js_sys::Reflect::get(value, &JsValue::from_str("tileUrl"))
        .ok()
        .and_then(|f| f.dyn_into::<Function>().ok());
    let Some(tile_url) = tile_url else {
        let descriptor: ImageSourceDescriptor =
            serde_wasm_bindgen::from_value(value.clone()).map_err(js_err)?;
        return ImageSource::from_descriptor(descriptor).map_err(js_err);
    };

    let geometry: SourceGeometry = serde_wasm_bindgen::from_value(value.clone()).map_err(js_err)?;
    let url_fn: TileUrlFn = Rc::new(move |key: TileKey| {
        match tile_url.call3(
            &JsValue::NULL,
            &JsValue::from(key.tier()),
            &JsValue::from(key.x()),
            &JsValue::from(key.y()),
        ) {
            Ok(url) => url.as_string().unwrap_or_default(),
            Err(err) => {
                warn!(tile = %key, ?err, "tileUrl threw");
                String::new()
            }
        }
    });
    ImageSource::new(
        geometry.width,
        geometry.height,
        geometry.tile_size,
        geometry.max_tier_zoom,
        url_fn,
    )
    .map_err(js_err)
}

/// `undefined`/`null` for defaults, a JSON string, or a config object.
fn parse_config(value: &JsValue) -> Result<RendererConfig, JsValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(RendererConfig::default());
    }
    if let Some(json) = value.as_string() {
        return RendererConfig::from_json(&json).map_err(js_err);
    }
    let config: RendererConfig = serde_wasm_bindgen::from_value(value.clone()).map_err(js_err)?;
    config.validate().map_err(js_err)?;
    Ok(config)
}

/// CSS size of the canvas and the device pixel ratio.
fn css_size(canvas: &HtmlCanvasElement) -> (f64, f64, f64) {
    let dpr = web_sys::window()
        .map(|w| w.device_pixel_ratio())
        .filter(|d| *d > 0.0)
        .unwrap_or(1.0);
    let rect = canvas.get_bounding_client_rect();
    let (w, h) = if rect.width() > 0.0 && rect.height() > 0.0 {
        (rect.width(), rect.height())
    } else {
        (canvas.width() as f64 / dpr, canvas.height() as f64 / dpr)
    };
    (w.max(1.0), h.max(1.0), dpr)
}

fn set_backing_store(canvas: &HtmlCanvasElement, width: f64, height: f64, dpr: f64) -> (u32, u32) {
    let px_w = (width * dpr).round().max(1.0) as u32;
    let px_h = (height * dpr).round().max(1.0) as u32;
    if canvas.width() != px_w {
        canvas.set_width(px_w);
    }
    if canvas.height() != px_h {
        canvas.set_height(px_h);
    }
    (px_w, px_h)
}

type Listener = (&'static str, Closure<dyn FnMut(Event)>);

/// Gigapixel slide viewer bound to one canvas.
#[wasm_bindgen]
pub struct SlideViewer {
    state: SharedState,
    canvas: HtmlCanvasElement,
    listeners: Vec<Listener>,
}

#[wasm_bindgen]
impl SlideViewer {
    /// Initialise the GPU device and renderer and fit the image to the canvas.
    pub async fn create(
        canvas: HtmlCanvasElement,
        source: JsValue,
        config: JsValue,
        token: Option<String>,
    ) -> Result<SlideViewer, JsValue> {
        let source = parse_source(&source)?;
        let config = parse_config(&config)?;
        let (width, height, dpr) = css_size(&canvas);
        set_backing_store(&canvas, width, height, dpr);

        let device = WgpuDevice::init(canvas.clone()).await.map_err(js_err)?;
        let mut renderer = Renderer::new(source, config, width, height).map_err(js_err)?;
        renderer.set_auth_token(token);

        let state = Rc::new_cyclic(|weak| {
            RefCell::new(ViewerState {
                renderer,
                device,
                host: BrowserHost::new(weak.clone()),
            })
        });
        {
            let mut guard = state.borrow_mut();
            let ViewerState { renderer, host, .. } = &mut *guard;
            renderer.resize(width, height, dpr, host);
        }
        info!(width, height, dpr, "slide viewer created");

        let mut viewer = SlideViewer {
            state,
            canvas,
            listeners: Vec::new(),
        };
        viewer.attach_context_listeners()?;
        Ok(viewer)
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut ViewerState) -> Result<R, JsValue>,
    ) -> Result<R, JsValue> {
        let mut guard = self.state.try_borrow_mut().map_err(|_| busy())?;
        f(&mut guard)
    }

    /// Apply a partial `{zoom, offsetX, offsetY}` and return the resolved view.
    #[wasm_bindgen(js_name = setView)]
    pub fn set_view(&self, update: JsValue) -> Result<JsValue, JsValue> {
        let update: ViewUpdate = serde_wasm_bindgen::from_value(update).map_err(js_err)?;
        self.with_state(|s| to_js(&s.renderer.set_view(update, &mut s.host)))
    }

    #[wasm_bindgen(js_name = zoomAt)]
    pub fn zoom_at(&self, factor: f64, screen_x: f64, screen_y: f64) -> Result<JsValue, JsValue> {
        self.with_state(|s| {
            to_js(&s.renderer.zoom_at(factor, screen_x, screen_y, &mut s.host))
        })
    }

    #[wasm_bindgen(js_name = panBy)]
    pub fn pan_by(&self, dx: f64, dy: f64) -> Result<JsValue, JsValue> {
        self.with_state(|s| to_js(&s.renderer.pan_by(dx, dy, &mut s.host)))
    }

    /// Resize to the canvas's current CSS box, or to the given CSS size.
    pub fn resize(&self, width: Option<f64>, height: Option<f64>) -> Result<JsValue, JsValue> {
        let (css_w, css_h, dpr) = css_size(&self.canvas);
        let width = width.filter(|w| *w > 0.0).unwrap_or(css_w);
        let height = height.filter(|h| *h > 0.0).unwrap_or(css_h);
        let (px_w, px_h) = set_backing_store(&self.canvas, width, height, dpr);
        self.with_state(|s| {
            s.device.resize(px_w, px_h, dpr as f32);
            to_js(&s.renderer.resize(width, height, dpr, &mut s.host))
        })
    }

    #[wasm_bindgen(js_name = setImageSource)]
    pub fn set_image_source(&self, source: JsValue) -> Result<JsValue, JsValue> {
        let source = parse_source(&source)?;
        self.with_state(|s| {
            let view = s
                .renderer
                .set_image_source(source, &mut s.device, &mut s.host)
                .map_err(js_err)?;
            to_js(&view)
        })
    }

    #[wasm_bindgen(js_name = setAuthToken)]
    pub fn set_auth_token(&self, token: Option<String>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.renderer.set_auth_token(token);
            Ok(())
        })
    }

    /// Interleaved world x/y positions and one palette index per point.
    #[wasm_bindgen(js_name = setPoints)]
    pub fn set_points(&self, positions: Vec<f32>, palette_indices: Vec<u16>) -> Result<(), JsValue> {
        let buffer = PointBuffer::new(positions, palette_indices).map_err(js_err)?;
        self.with_state(|s| {
            s.renderer
                .set_points(buffer, &mut s.device, &mut s.host)
                .map_err(js_err)
        })
    }

    /// Fetch raw little-endian `f32` positions and `u16` palette indices and
    /// install them. Resolves to the point count.
    #[wasm_bindgen(js_name = loadPoints)]
    pub fn load_points(&self, positions_url: String, indices_url: String) -> Promise {
        let state = Rc::downgrade(&self.state);
        let token = self
            .state
            .try_borrow()
            .ok()
            .and_then(|s| s.renderer.auth_token().map(str::to_owned));
        future_to_promise(async move {
            let positions = fetch_bytes(&positions_url, token.as_deref(), None)
                .await
                .map_err(js_err)?;
            let indices = fetch_bytes(&indices_url, token.as_deref(), None)
                .await
                .map_err(js_err)?;
            let buffer = PointBuffer::new(
                f32_le(&positions).map_err(js_err)?,
                u16_le(&indices).map_err(js_err)?,
            )
            .map_err(js_err)?;
            let count = buffer.count();

            let state = state
                .upgrade()
                .ok_or_else(|| JsValue::from_str("viewer was dropped"))?;
            let mut guard = state.try_borrow_mut().map_err(|_| busy())?;
            let ViewerState {
                renderer,
                device,
                host,
            } = &mut *guard;
            renderer.set_points(buffer, device, host).map_err(js_err)?;
            info!(count, "points loaded");
            Ok(JsValue::from(count as u32))
        })
    }

    /// Flat RGBA palette, four bytes per entry.
    #[wasm_bindgen(js_name = setPalette)]
    pub fn set_palette(&self, rgba: Vec<u8>) -> Result<(), JsValue> {
        let palette = Palette::new(rgba).map_err(js_err)?;
        self.with_state(|s| {
            s.renderer
                .set_palette(palette, &mut s.device, &mut s.host)
                .map_err(js_err)
        })
    }

    #[wasm_bindgen(js_name = setPointsVisible)]
    pub fn set_points_visible(&self, visible: bool) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.renderer.set_points_visible(visible, &mut s.host);
            Ok(())
        })
    }

    #[wasm_bindgen(js_name = getView)]
    pub fn get_view(&self) -> Result<JsValue, JsValue> {
        let guard = self.state.try_borrow().map_err(|_| busy())?;
        to_js(&guard.renderer.view())
    }

    #[wasm_bindgen(js_name = onStats)]
    pub fn on_stats(&self, callback: Option<Function>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.host.callbacks.on_stats = callback;
            Ok(())
        })
    }

    #[wasm_bindgen(js_name = onScheduler)]
    pub fn on_scheduler(&self, callback: Option<Function>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.host.callbacks.on_scheduler = callback;
            Ok(())
        })
    }

    #[wasm_bindgen(js_name = onTileError)]
    pub fn on_tile_error(&self, callback: Option<Function>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.host.callbacks.on_tile_error = callback;
            Ok(())
        })
    }

    #[wasm_bindgen(js_name = onViewChange)]
    pub fn on_view_change(&self, callback: Option<Function>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.host.callbacks.on_view_change = callback;
            Ok(())
        })
    }

    #[wasm_bindgen(js_name = onContextLost)]
    pub fn on_context_lost(&self, callback: Option<Function>) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.host.callbacks.on_context_lost = callback;
            Ok(())
        })
    }

    /// Cancel all fetches, release GPU resources and detach from the canvas.
    pub fn destroy(&mut self) -> Result<(), JsValue> {
        self.with_state(|s| {
            s.renderer.destroy(&mut s.device, &mut s.host);
            s.host.shutdown();
            s.host.callbacks = Default::default();
            Ok(())
        })?;
        self.detach_listeners();
        Ok(())
    }
}

impl SlideViewer {
    fn attach_context_listeners(&mut self) -> Result<(), JsValue> {
        let weak = Rc::downgrade(&self.state);
        let on_lost = Closure::<dyn FnMut(Event)>::new(move |event: Event| {
            // Without preventDefault the browser never fires the restore event.
            event.prevent_default();
            let Some(state) = weak.upgrade() else {
                return;
            };
            let Ok(mut guard) = state.try_borrow_mut() else {
                warn!("context loss while viewer busy");
                return;
            };
            let ViewerState {
                renderer,
                device,
                host,
            } = &mut *guard;
            device.mark_lost();
            renderer.context_lost(host);
        });

        let weak = Rc::downgrade(&self.state);
        let canvas = self.canvas.clone();
        let on_restored = Closure::<dyn FnMut(Event)>::new(move |_event: Event| {
            let weak = weak.clone();
            let canvas = canvas.clone();
            spawn_local(async move {
                let device = match WgpuDevice::init(canvas).await {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(%err, "failed to rebuild GPU device after context restore");
                        return;
                    }
                };
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let Ok(mut guard) = state.try_borrow_mut() else {
                    warn!("context restore while viewer busy");
                    return;
                };
                if guard.renderer.is_destroyed() {
                    return;
                }
                guard.device = device;
                let ViewerState { renderer, host, .. } = &mut *guard;
                renderer.context_restored(host);
            });
        });

        for (name, closure) in [
            ("webglcontextlost", on_lost),
            ("webglcontextrestored", on_restored),
        ] {
            self.canvas
                .add_event_listener_with_callback(name, closure.as_ref().unchecked_ref())?;
            self.listeners.push((name, closure));
        }
        Ok(())
    }

    fn detach_listeners(&mut self) {
        for (name, closure) in self.listeners.drain(..) {
            let _ = self
                .canvas
                .remove_event_listener_with_callback(name, closure.as_ref().unchecked_ref());
        }
    }
}

impl Drop for SlideViewer {
    fn drop(&mut self) {
        self.detach_listeners();
        if let Ok(mut guard) = self.state.try_borrow_mut() {
            let ViewerState {
                renderer,
                device,
                host,
            } = &mut *guard;
            renderer.destroy(device, host);
            host.shutdown();
        }
    }
}
