/// Landing page; the companion app does the real work over `/ws`.
pub fn index(device_id: &str, ip: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Smart Gas Monitor</title>
  <style>body{{font-family:Arial,sans-serif;text-align:center;margin:0;padding:20px}}</style>
</head>
<body>
  <h1>Smart Gas and Temperature Monitor</h1>
  <p>Use the mobile app for full functionality.</p>
  <p>Device ID: {device_id}</p>
  <p>IP Address: {ip}</p>
</body>
</html>
"#
    )
}
