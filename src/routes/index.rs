use crate::{model_service::SegmentationModel, server::SharedState};
use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse},
};

const INDEX_TEMPLATE: &str = include_str!("../../static/index.html");
const TITLE_PLACEHOLDER: &str = "{{page_title}}";

pub fn render_index_page(page_title: &str) -> String {
    INDEX_TEMPLATE.replace(TITLE_PLACEHOLDER, &escape_html(page_title))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub async fn index_page<M: SegmentationModel>(State(state): State<SharedState<M>>) -> Html<String> {
    Html(state.index_page.as_str().to_owned())
}

pub async fn logo<M: SegmentationModel>(State(state): State<SharedState<M>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], state.logo.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_index_page() {
        let page = render_index_page("Lung <Scan>");

        assert!(page.contains("<title>Lung &lt;Scan&gt;</title>"));
        assert!(!page.contains(TITLE_PLACEHOLDER));
        assert!(page.contains("accept=\".jpg,.jpeg,.png\""));
    }

    #[test]
    fn test_index_page_releases_previous_images() {
        let page = render_index_page("Lung Scan");

        assert_eq!(page.matches("URL.createObjectURL").count(), 1);
        assert!(page.contains("URL.revokeObjectURL(img.src)"));
    }
}
