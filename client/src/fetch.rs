use gloo_net::http::Request;
use js_sys::{Array, Uint8Array};
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{AbortSignal, Blob, BlobPropertyBag, HtmlCanvasElement, HtmlImageElement, Url};

use slidescope_engine::{FetchError, TileImage};

use crate::decode::{bearer, image_mime, status_error};

/// GET `url` and return the body bytes. An aborted signal yields
/// `FetchError::Cancelled`.
pub async fn fetch_bytes(
    url: &str,
    token: Option<&str>,
    signal: Option<&AbortSignal>,
) -> Result<Vec<u8>, FetchError> {
    let mut request = Request::get(url).abort_signal(signal);
    if let Some(header) = bearer(token) {
        request = request.header("Authorization", &header);
    }
    let cancelled = || signal.is_some_and(AbortSignal::aborted);

    let response = request.send().await.map_err(|e| {
        if cancelled() {
            FetchError::Cancelled
        } else {
            FetchError::Network(e.to_string())
        }
    })?;
    if let Some(err) = status_error(response.status()) {
        return Err(err);
    }
    response.binary().await.map_err(|e| {
        if cancelled() {
            FetchError::Cancelled
        } else {
            FetchError::Network(e.to_string())
        }
    })
}

/// Fetch one tile and decode it to RGBA pixels. Without a signal the
/// request cannot be aborted; its result still settles the ticket.
pub async fn fetch_tile(
    url: &str,
    token: Option<&str>,
    signal: Option<&AbortSignal>,
) -> Result<TileImage, FetchError> {
    let bytes = fetch_bytes(url, token, signal).await?;
    if signal.is_some_and(AbortSignal::aborted) {
        return Err(FetchError::Cancelled);
    }
    decode_image(&bytes, image_mime(url)).await
}

/// Decode encoded image bytes through an `<img>` element and read the
/// pixels back from a scratch 2D canvas.
async fn decode_image(bytes: &[u8], mime: &str) -> Result<TileImage, FetchError> {
    let decode_err = |what: &str| FetchError::Decode(what.to_string());

    let parts = Array::of1(&Uint8Array::from(bytes));
    let options = BlobPropertyBag::new();
    options.set_type(mime);
    let blob = Blob::new_with_u8_array_sequence_and_options(&parts, &options)
        .map_err(|_| decode_err("blob construction failed"))?;
    let object_url =
        Url::create_object_url_with_blob(&blob).map_err(|_| decode_err("object URL failed"))?;

    let result = read_pixels(&object_url).await;
    let _ = Url::revoke_object_url(&object_url);
    result
}

async fn read_pixels(object_url: &str) -> Result<TileImage, FetchError> {
    let decode_err = |what: &str| FetchError::Decode(what.to_string());

    let img = HtmlImageElement::new().map_err(|_| decode_err("image element unavailable"))?;
    img.set_src(object_url);
    JsFuture::from(img.decode())
        .await
        .map_err(|_| decode_err("image decode failed"))?;

    let (w, h) = (img.natural_width(), img.natural_height());
    if w == 0 || h == 0 {
        return Err(decode_err("image has no pixels"));
    }

    let document = web_sys::window()
        .and_then(|window| window.document())
        .ok_or_else(|| decode_err("document is unavailable"))?;
    let canvas = document
        .create_element("canvas")
        .ok()
        .and_then(|element| element.dyn_into::<HtmlCanvasElement>().ok())
        .ok_or_else(|| decode_err("scratch canvas unavailable"))?;
    canvas.set_width(w);
    canvas.set_height(h);
    let ctx = canvas
        .get_context("2d")
        .ok()
        .flatten()
        .and_then(|ctx| ctx.dyn_into::<web_sys::CanvasRenderingContext2d>().ok())
        .ok_or_else(|| decode_err("2d context unavailable"))?;
    ctx.draw_image_with_html_image_element(&img, 0.0, 0.0)
        .map_err(|_| decode_err("drawImage failed"))?;
    let data = ctx
        .get_image_data(0.0, 0.0, w as f64, h as f64)
        .map_err(|_| decode_err("getImageData failed"))?;

    TileImage::new(w, h, data.data().0).map_err(|e| FetchError::Decode(e.to_string()))
}
