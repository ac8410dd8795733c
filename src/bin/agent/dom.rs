use anyhow::Result;
use headless_chrome::Tab;

use task_agent::types::{DOM_SNAPSHOT_MAX_CHARS, PageState, truncate_chars};

/// Read-only page outline. Interactive elements get a `data-eid="[eN]"` attribute
/// so the oracle can target them as `[data-eid="[eN]"]`; short text leaves are
/// listed in document order.
const OUTLINE_JS: &str = r#"
(() => {
  const interactive = 'a[href], button, input:not([type=hidden]), textarea, select, [role=button], [contenteditable=true]';
  const visible = (el) => {
    const box = el.getBoundingClientRect();
    if (box.width === 0 && box.height === 0) return false;
    const style = getComputedStyle(el);
    return style.visibility !== 'hidden' && style.display !== 'none';
  };
  const clip = (s, n) => (s || '').replace(/\s+/g, ' ').trim().slice(0, n);
  const out = [];
  const dedupe = new Set();
  const emit = (line) => { if (line && !dedupe.has(line)) { dedupe.add(line); out.push(line); } };

  let next = 0;
  for (const el of document.querySelectorAll(interactive)) {
    if (!visible(el)) continue;
    const eid = '[e' + (next++) + ']';
    el.setAttribute('data-eid', eid);
    const tag = el.tagName.toLowerCase();
    const label = clip(el.getAttribute('aria-label') || el.innerText || el.value || el.placeholder, 60);
    if (tag === 'input' || tag === 'textarea') {
      let line = `${eid} ${tag}[${el.type || 'text'}]`;
      if (el.name) line += ` name=${el.name}`;
      if (el.placeholder) line += ` placeholder="${clip(el.placeholder, 40)}"`;
      if (el.value) line += ` value="${clip(el.value, 30)}"`;
      emit(line);
    } else if (tag === 'select') {
      emit(`${eid} select [${[...el.options].map(o => clip(o.text, 20)).join('|')}]`);
    } else if (tag === 'a') {
      emit(`${eid} link "${label}"`);
    } else {
      emit(`${eid} ${tag === 'button' ? 'button' : 'control'} "${label}"`);
    }
  }

  const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
  while (walker.nextNode()) {
    const parent = walker.currentNode.parentElement;
    if (!parent || parent.closest('script,style,noscript,svg,[data-eid]')) continue;
    const text = clip(walker.currentNode.textContent, 100);
    if (text.length > 2 && visible(parent)) emit(`  "${text}"`);
  }
  return out.join('\n');
})()
"#;

fn eval_string(tab: &Tab, expression: &str) -> Result<Option<String>> {
    let result = tab.evaluate(expression, false)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

pub fn page_state(tab: &Tab) -> Result<PageState> {
    let url = eval_string(tab, "window.location.href")?.unwrap_or_else(|| "unknown".to_string());
    let title = eval_string(tab, "document.title")?.unwrap_or_default();
    let outline = eval_string(tab, OUTLINE_JS)?.unwrap_or_default();
    Ok(PageState {
        url,
        title,
        dom_snapshot: truncate_chars(&outline, DOM_SNAPSHOT_MAX_CHARS),
    })
}

/// `innerText` of the first match, or of the body.
pub fn visible_text(tab: &Tab, selector: Option<&str>) -> Result<String> {
    let expression = match selector {
        Some(selector) => format!(
            "(document.querySelector({}) || {{}}).innerText || ''",
            js_string(selector)
        ),
        None => "document.body ? document.body.innerText : ''".to_string(),
    };
    Ok(eval_string(tab, &expression)?.unwrap_or_default())
}

pub fn outer_html(tab: &Tab, selector: Option<&str>) -> Result<String> {
    let expression = match selector {
        Some(selector) => format!(
            "(document.querySelector({}) || {{}}).outerHTML || ''",
            js_string(selector)
        ),
        None => "document.documentElement.outerHTML".to_string(),
    };
    Ok(eval_string(tab, &expression)?.unwrap_or_default())
}

pub fn scroll_by(tab: &Tab, delta_y: i64) -> Result<()> {
    let expression = match delta_y {
        i64::MIN => "window.scrollTo(0, 0)".to_string(),
        i64::MAX => "window.scrollTo(0, document.body.scrollHeight)".to_string(),
        delta => format!("window.scrollBy(0, {delta})"),
    };
    tab.evaluate(&expression, false)?;
    Ok(())
}

/// Quote `raw` as a JavaScript string literal.
fn js_string(raw: &str) -> String {
    serde_json::Value::String(raw.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_are_quoted_safely() {
        assert_eq!(js_string(r#"a[title='x"y']"#), r#""a[title='x\"y']""#);
    }
}
